// globechat-common: wire protocol and shared record types for the GlobeChat relay

pub mod protocol;
pub mod types;
