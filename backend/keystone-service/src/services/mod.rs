/// Business logic services
pub mod audit;
pub mod authorize;
pub mod jobs;
pub mod keystore;
pub mod kms;
pub mod session;
pub mod token;
