pub mod generation_log;
pub mod history;
pub mod ledger;
pub mod summary;
