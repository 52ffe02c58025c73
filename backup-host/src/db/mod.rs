pub mod connection;
pub mod migrate;
pub mod tenant_database;
