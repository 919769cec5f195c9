pub mod auth;
pub mod diff;
pub mod fetcher;
pub mod notifier;
pub mod retry;
pub mod validator;
