pub mod order;
pub mod processed_webhook_event;
