pub(crate) mod data_deletion_controller;
pub(crate) mod health_check_controller;
pub(crate) mod oauth_controller;
pub(crate) mod webhook_controller;
