//! Simulcast layer priority from the publisher's SDP

use std::io::Cursor;
use tracing::{debug, warn};
use webrtc::sdp::description::session::SessionDescription;

/// Priority of layers the publisher did not rank
pub const DEFAULT_PRIORITY: u32 = 100;

/// Priority of `layer` according to the `a=simulcast:send` attributes of
/// `sdp`. Layers are ranked by their position in the list, 1 being the most
/// preferred. The position keeps counting across media sections.
#[must_use]
pub fn layer_priority(layer: &str, sdp: &str) -> u32 {
    let description = match SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes())) {
        Ok(description) => description,
        Err(e) => {
            warn!(layer = %layer, error = %e, "Failed to parse SDP for simulcast priority");
            return DEFAULT_PRIORITY;
        }
    };

    let mut priority = 1;
    for media in &description.media_descriptions {
        for attribute in &media.attributes {
            if attribute.key != "simulcast" {
                continue;
            }
            let Some(layers) = attribute
                .value
                .as_deref()
                .and_then(|value| value.strip_prefix("send "))
            else {
                continue;
            };

            for candidate in layers.trim().split(';') {
                if !candidate.is_empty() && candidate.eq_ignore_ascii_case(layer) {
                    debug!(layer = %layer, priority, "Resolved simulcast priority");
                    return priority;
                }
                priority += 1;
            }
        }
    }

    DEFAULT_PRIORITY
}
