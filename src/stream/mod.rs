pub mod fetcher;
pub mod router;
pub mod supervisor;
pub mod worker;
