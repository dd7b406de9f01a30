mod balance;
mod transaction;

pub use balance::{BalanceProvider, StoreCas};
pub use transaction::TransactionProvider;
