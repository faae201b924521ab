//! FinancialLedger (§4.3) and HousePool (§4.4): the only code paths
//! allowed to mutate user balances and the per-asset liability counter.

pub mod financial;
pub mod house_pool;

pub use financial::FinancialLedger;
pub use house_pool::HousePoolLedger;
