pub(crate) mod connect_identity;
