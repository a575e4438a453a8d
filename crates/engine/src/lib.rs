pub mod channels;
pub mod history;
pub mod locks;
pub mod preferences;
pub mod store;
pub mod templates;
