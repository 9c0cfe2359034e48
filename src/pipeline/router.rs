//! Recipient router — known/unknown classification.

use crate::config::EndpointMapping;
use crate::pipeline::types::Recipients;

/// One webhook delivery a known message fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Recipient address as given in the envelope.
    pub recipient: String,
    pub endpoint: String,
}

/// Routing decision for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// At least one recipient has a webhook. Only those recipients are listed,
    /// in envelope order.
    Known(Vec<Delivery>),
    /// No recipient has a webhook; nothing is forwarded.
    Unknown,
}

impl Route {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// Classify a recipient list against the endpoint mapping.
///
/// Matching is case-insensitive. Recipients without a webhook in an
/// otherwise known message are simply left out.
pub fn route(recipients: &Recipients, endpoints: &EndpointMapping) -> Route {
    let deliveries: Vec<Delivery> = recipients
        .iter()
        .filter_map(|recipient| {
            endpoints.endpoint_for(recipient).map(|endpoint| Delivery {
                recipient: recipient.to_string(),
                endpoint: endpoint.to_string(),
            })
        })
        .collect();

    if deliveries.is_empty() {
        Route::Unknown
    } else {
        Route::Known(deliveries)
    }
}
