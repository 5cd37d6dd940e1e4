pub mod backoff;
pub mod dao;
pub mod engine;
pub mod ledger;
pub mod local;
pub mod local_watcher;
pub mod processor;
pub mod queue;
pub mod remote_watcher;
pub mod states;
pub mod stop;
pub mod transfer;
