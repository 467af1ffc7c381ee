pub mod audit;
pub mod chat;
pub mod documents;
pub mod error;
