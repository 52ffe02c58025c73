pub mod local_storage;
pub mod object_store;
pub mod tenant_settings;
