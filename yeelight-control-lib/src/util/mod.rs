pub mod discovery;
pub mod traits;
