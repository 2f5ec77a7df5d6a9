pub mod bitrix;
pub mod bitrix_api;
pub mod destination;
pub mod freshdesk;
