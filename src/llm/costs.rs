//! Per-token model pricing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Returns (input, output) cost per token in USD for a model name.
///
/// Unknown models fall back to Sonnet pricing.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    if model.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if model.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if model.contains("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if model.contains("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else {
        (dec!(0.000003), dec!(0.000015))
    }
}
