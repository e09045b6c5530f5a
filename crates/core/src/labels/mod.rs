pub mod label_registry;
