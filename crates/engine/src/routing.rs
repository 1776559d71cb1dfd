//! Channel and priority resolution for incoming insights.

use herald_common::config::RoutingConfig;
use herald_common::types::{InsightEvent, Priority};

/// Fills in what an event leaves out: its priority (from the insight type)
/// and its destination channel (insight-type mapping, then per-priority
/// default).
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    config: RoutingConfig,
}

impl ChannelRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn resolve_priority(&self, event: &InsightEvent) -> Priority {
        event
            .priority
            .or_else(|| event.insight_type.map(|t| t.default_priority()))
            .unwrap_or(Priority::Normal)
    }

    /// `None` when neither the event nor the routing table names a channel.
    pub fn resolve_channel(&self, event: &InsightEvent, priority: Priority) -> Option<String> {
        if let Some(explicit) = non_blank(event.channel_target.as_deref()) {
            return Some(explicit.to_string());
        }

        let mapped = event
            .insight_type
            .and_then(|t| self.config.type_channels.get(&t))
            .map(String::as_str);
        if let Some(channel) = non_blank(mapped) {
            return Some(channel.to_string());
        }

        let fallback = match priority {
            Priority::High => &self.config.high_priority_channel,
            Priority::Normal => &self.config.normal_priority_channel,
        };
        non_blank(Some(fallback)).map(str::to_string)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
