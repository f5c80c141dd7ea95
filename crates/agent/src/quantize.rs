use rust_decimal::Decimal;

use crate::model::QuantizedPrice;

/// Implied decimal places of a quantized price
pub const QUANTIZED_DECIMALS: u32 = 18;

/// Trailing digits zeroed to suppress sub-unit jitter
const ZEROED_DIGITS: usize = 6;

/// Scale `value` by 10^18, truncating toward zero, then zero the last six
/// characters of the integer string when it is longer than six.
pub fn quantize(value: &Decimal) -> QuantizedPrice {
    let mantissa = value.mantissa();
    let scale = value.scale();

    let scaled = if mantissa == 0 {
        "0".to_string()
    } else if scale <= QUANTIZED_DECIMALS {
        let padding = (QUANTIZED_DECIMALS - scale) as usize;
        format!("{}{}", mantissa, "0".repeat(padding))
    } else {
        // Decimal scale tops out at 28, so the divisor fits comfortably
        let divisor = 10i128.pow(scale - QUANTIZED_DECIMALS);
        (mantissa / divisor).to_string()
    };

    QuantizedPrice(zero_trailing_digits(scaled))
}

fn zero_trailing_digits(mut digits: String) -> String {
    if digits.len() > ZEROED_DIGITS {
        digits.truncate(digits.len() - ZEROED_DIGITS);
        digits.push_str(&"0".repeat(ZEROED_DIGITS));
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn q(s: &str) -> String {
        quantize(&Decimal::from_str(s).unwrap()).0
    }

    #[test]
    fn test_quantize_known_values() {
        assert_eq!(q("72147.681412670819"), "72147681412670819000000");
        assert_eq!(q("3.33595034988"), "3335950349880000000");
        assert_eq!(q("1.0"), "1000000000000000000");
        assert_eq!(q("2"), "2000000000000000000");
    }

    #[test]
    fn test_quantize_truncates_rather_than_rounds() {
        // 1.2345678999999999999 * 1e18 = 1234567899999999999.9
        assert_eq!(q("1.2345678999999999999"), "1234567899999000000");
    }

    #[test]
    fn test_quantize_zero_and_tiny() {
        assert_eq!(q("0"), "0");
        assert_eq!(q("0.000"), "0");
        // 1e-15 scales to 1000, too short to zero
        assert_eq!(q("0.000000000000001"), "1000");
        // below 1e-18 truncates to zero
        assert_eq!(q("0.0000000000000000001"), "0");
    }

    #[test]
    fn test_quantize_negative() {
        assert_eq!(q("-60000"), "-60000000000000000000000");
        // the sign counts toward the length check
        assert_eq!(q("-0.00000000000001"), "-10000");
        assert_eq!(q("-0.000000000001"), "-1000000");
        assert_eq!(q("-0.000000000001234567"), "-1000000");
    }
}
