pub mod ambulance;
pub mod request;
pub mod tracking;
