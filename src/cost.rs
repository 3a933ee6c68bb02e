//! Cost computation and cache-breakpoint placement.

use crate::types::{
    ContentPart, MessageContent, ModelInfo, ModelPricing, RequestMessage, Role, UsageSnapshot,
};

const TOKENS_PER_DOLLAR_UNIT: f64 = 1_000_000.0;

/// How many trailing user messages receive a cache marker. Together with the
/// system message that caps cache writes at three segments per request.
const CACHED_USER_MESSAGES: usize = 2;

/// Effective prices for a request: tier overrides where present, base prices
/// otherwise.
fn effective_pricing(info: &ModelInfo, input_tokens: u64) -> ModelPricing {
    let tier = info
        .tiers
        .iter()
        .find(|t| t.context_window >= input_tokens);
    match tier {
        Some(t) => ModelPricing {
            input: t.prices.input.or(info.pricing.input),
            output: t.prices.output.or(info.pricing.output),
            cache_read: t.prices.cache_read.or(info.pricing.cache_read),
            cache_write: t.prices.cache_write.or(info.pricing.cache_write),
        },
        None => info.pricing.clone(),
    }
}

/// Billed cost in USD for one response, or None when the model carries no
/// price data at all ("free or unknown" is not the same as zero).
pub fn calculate_cost(info: &ModelInfo, usage: &UsageSnapshot) -> Option<f64> {
    if info.pricing.is_empty() && info.tiers.is_empty() {
        return None;
    }

    let cache_read = usage.cache_read_tokens.unwrap_or(0);
    let cache_write = usage.cache_write_tokens.unwrap_or(0);
    let prices = effective_pricing(info, usage.input_tokens);

    let uncached_input = usage.input_tokens.saturating_sub(cache_read);
    let cost = uncached_input as f64 * prices.input.unwrap_or(0.0) / TOKENS_PER_DOLLAR_UNIT
        + usage.output_tokens as f64 * prices.output.unwrap_or(0.0) / TOKENS_PER_DOLLAR_UNIT
        + cache_read as f64 * prices.cache_read.unwrap_or(0.0) / TOKENS_PER_DOLLAR_UNIT
        + cache_write as f64 * prices.cache_write.unwrap_or(0.0) / TOKENS_PER_DOLLAR_UNIT;
    Some(cost)
}

/// Mark the last two user messages as cache candidates. Plain-text content is
/// wrapped into a single annotated part; part lists get the marker on their
/// last text part. The system message is annotated by the vendor shaping code
/// itself, so every request writes at most three cached segments.
pub fn apply_cache_breakpoints(messages: &mut [RequestMessage]) {
    let mut marked = 0;
    for msg in messages.iter_mut().rev() {
        if marked == CACHED_USER_MESSAGES {
            break;
        }
        if msg.role != Role::User {
            continue;
        }
        mark_message(msg);
        marked += 1;
    }
}

fn mark_message(msg: &mut RequestMessage) {
    match &mut msg.content {
        MessageContent::Text(text) => {
            msg.content = MessageContent::Parts(vec![ContentPart::Text {
                text: std::mem::take(text),
                cache: true,
            }]);
        }
        MessageContent::Parts(parts) => {
            if let Some(ContentPart::Text { cache, .. }) = parts
                .iter_mut()
                .rev()
                .find(|p| matches!(p, ContentPart::Text { .. }))
            {
                *cache = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PricingTier;

    fn priced_info() -> ModelInfo {
        ModelInfo {
            pricing: ModelPricing {
                input: Some(3.0),
                output: Some(15.0),
                cache_read: Some(0.3),
                cache_write: Some(3.75),
            },
            ..Default::default()
        }
    }

    fn usage(input: u64, output: u64, cache_read: u64) -> UsageSnapshot {
        UsageSnapshot {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: Some(cache_read),
            ..Default::default()
        }
    }

    #[test]
    fn unpriced_model_has_undefined_cost() {
        let info = ModelInfo::default();
        assert_eq!(calculate_cost(&info, &usage(1000, 1000, 0)), None);
    }

    #[test]
    fn zero_usage_on_priced_model_is_zero_not_none() {
        let info = priced_info();
        assert_eq!(calculate_cost(&info, &usage(0, 0, 0)), Some(0.0));
    }

    #[test]
    fn basic_cost_formula() {
        let info = priced_info();
        let cost = calculate_cost(&info, &usage(1_000_000, 1_000_000, 0)).unwrap();
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn cache_reads_are_discounted_from_input() {
        let info = priced_info();
        let cost = calculate_cost(&info, &usage(1_000_000, 0, 400_000)).unwrap();
        // 600k uncached at $3/M + 400k cached at $0.30/M
        assert!((cost - (1.8 + 0.12)).abs() < 1e-9);
    }

    #[test]
    fn cache_reads_exceeding_input_clamp_to_zero() {
        let info = priced_info();
        let cost = calculate_cost(&info, &usage(100, 0, 500)).unwrap();
        // uncached input clamps at 0; only the cache-read charge remains
        assert!((cost - 500.0 * 0.3 / 1e6).abs() < 1e-12);
    }

    #[test]
    fn cost_monotonic_in_each_counter() {
        let info = priced_info();
        let base = calculate_cost(&info, &usage(10_000, 5_000, 2_000)).unwrap();
        assert!(calculate_cost(&info, &usage(20_000, 5_000, 2_000)).unwrap() >= base);
        assert!(calculate_cost(&info, &usage(10_000, 9_000, 2_000)).unwrap() >= base);
        assert!(calculate_cost(&info, &usage(10_000, 5_000, 4_000)).unwrap() <= base);
    }

    #[test]
    fn tier_selection_by_input_tokens() {
        let mut info = priced_info();
        info.tiers = vec![
            PricingTier {
                context_window: 128_000,
                prices: ModelPricing {
                    input: Some(1.0),
                    output: Some(2.0),
                    ..Default::default()
                },
            },
            PricingTier {
                context_window: 1_000_000,
                prices: ModelPricing {
                    input: Some(2.0),
                    output: Some(4.0),
                    ..Default::default()
                },
            },
        ];

        let t1 = calculate_cost(&info, &usage(50_000, 0, 0)).unwrap();
        assert!((t1 - 50_000.0 * 1.0 / 1e6).abs() < 1e-9);

        let t2 = calculate_cost(&info, &usage(500_000, 0, 0)).unwrap();
        assert!((t2 - 500_000.0 * 2.0 / 1e6).abs() < 1e-9);

        // Larger than every tier threshold: base prices apply.
        let base = calculate_cost(&info, &usage(2_000_000, 0, 0)).unwrap();
        assert!((base - 2_000_000.0 * 3.0 / 1e6).abs() < 1e-9);
    }

    #[test]
    fn tier_fields_fall_back_to_base_prices() {
        let mut info = priced_info();
        info.tiers = vec![PricingTier {
            context_window: 128_000,
            prices: ModelPricing {
                input: Some(1.0),
                ..Default::default()
            },
        }];
        // Output price comes from the base since the tier omits it.
        let cost = calculate_cost(&info, &usage(1_000, 1_000_000, 0)).unwrap();
        assert!((cost - (1_000.0 * 1.0 / 1e6 + 15.0)).abs() < 1e-9);
    }

    #[test]
    fn breakpoints_mark_only_last_two_user_messages() {
        let mut messages = vec![
            RequestMessage::user("one"),
            RequestMessage::assistant("a1"),
            RequestMessage::user("two"),
            RequestMessage::assistant("a2"),
            RequestMessage::user("three"),
            RequestMessage::assistant("a3"),
            RequestMessage::user("four"),
        ];
        apply_cache_breakpoints(&mut messages);

        let marked: Vec<bool> = messages
            .iter()
            .map(|m| match &m.content {
                MessageContent::Parts(parts) => parts
                    .iter()
                    .any(|p| matches!(p, ContentPart::Text { cache: true, .. })),
                MessageContent::Text(_) => false,
            })
            .collect();
        assert_eq!(marked, vec![false, false, false, false, true, false, true]);
    }

    #[test]
    fn breakpoint_on_part_list_marks_last_text_part() {
        let mut messages = vec![RequestMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "first".into(),
                    cache: false,
                },
                ContentPart::Image {
                    data: "xxx".into(),
                    mime_type: "image/png".into(),
                },
                ContentPart::Text {
                    text: "last".into(),
                    cache: false,
                },
            ]),
        }];
        apply_cache_breakpoints(&mut messages);

        match &messages[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(
                    parts[0],
                    ContentPart::Text {
                        text: "first".into(),
                        cache: false
                    }
                );
                assert_eq!(
                    parts[2],
                    ContentPart::Text {
                        text: "last".into(),
                        cache: true
                    }
                );
            }
            _ => panic!("expected parts"),
        }
    }
}
