pub mod activation;
pub mod client;
pub mod job_execution;
pub mod license;
pub mod token;
pub mod user;

pub use activation::Entity as Activation;
pub use client::Entity as Client;
pub use job_execution::Entity as JobExecution;
pub use license::Entity as License;
pub use token::Entity as Token;
pub use user::Entity as User;
