//! Example channel handlers proving the pipeline end-to-end. The remaining
//! fifty-plus provider adapters are out of scope; see §1.

mod messenger;
mod sms_aggregator;
mod webchat;
mod whatsapp;

use courier_core::HandlerDescriptor;
use courier_media::MediaCache;
use std::sync::Arc;

pub use messenger::MessengerHandler;
pub use sms_aggregator::SmsAggregatorHandler;
pub use webchat::WebChatHandler;
pub use whatsapp::WhatsAppHandler;

/// Builds the explicit handler list the registry is constructed from. One
/// `MediaCache` is shared across every handler that uploads attachments.
pub fn build_handlers(media_cache: Arc<MediaCache>) -> Vec<HandlerDescriptor> {
    vec![
        HandlerDescriptor::new(Arc::new(WhatsAppHandler::new(media_cache.clone()))),
        HandlerDescriptor::new(Arc::new(MessengerHandler::new(media_cache))),
        HandlerDescriptor::new(Arc::new(SmsAggregatorHandler::new())),
        HandlerDescriptor::new(Arc::new(WebChatHandler::new())),
    ]
}
