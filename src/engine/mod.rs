pub mod locator;
pub mod requests;
pub mod tracker;
