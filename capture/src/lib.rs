pub mod balance;
pub mod filter;
pub mod frame;
pub mod receiver;
pub mod session;
pub mod storage;
