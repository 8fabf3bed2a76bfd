pub mod builders;
pub mod db;
pub mod harness;

pub use builders::{ClientBuilder, LicenseBuilder, SensorBuilder, UserBuilder};
pub use db::TestDb;
pub use harness::{form_request, test_keys, Harness};
