pub(crate) mod document_handlers;
pub(crate) mod health_handlers;
pub(crate) mod queue_handlers;
