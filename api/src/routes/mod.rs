pub mod audit;
pub mod chat;
pub mod health;
pub mod knowledge;
