// workshop-chat-common: wire protocol and domain types shared by the chat relay and its clients

pub mod protocol;
pub mod types;
