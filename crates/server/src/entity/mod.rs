pub mod acknowledgment;
pub mod emergency;
pub mod queued_message;
pub mod recipient_delivery;
