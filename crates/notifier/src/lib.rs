pub mod dispatcher;
pub mod gateway;
pub mod topics;
