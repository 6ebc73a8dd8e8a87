/// Option universe generation around the at-the-money strike
use crate::types::OptionType;

/// Round NIFTY spot to the nearest 100 for the ATM strike
pub fn round_to_atm(spot: f64) -> i64 {
    ((spot / 100.0).round() as i64) * 100
}

/// Generate the CE+PE symbol universe: ATM ± `scan_range` strikes at
/// `strike_step` spacing. Symbol format: NIFTY{expiry}{strike}{CE|PE}.
pub fn generate_option_symbols(
    atm_strike: i64,
    expiry: &str,
    scan_range: i64,
    strike_step: i64,
) -> Vec<String> {
    let mut symbols = Vec::with_capacity(((2 * scan_range + 1) * 2) as usize);

    for offset in -scan_range..=scan_range {
        let strike = atm_strike + offset * strike_step;
        for option_type in OptionType::BOTH {
            symbols.push(format!("NIFTY{}{}{}", expiry, strike, option_type.as_str()));
        }
    }

    symbols
}

/// Extract (strike, option type) back out of a generated symbol
pub fn parse_symbol(symbol: &str, expiry: &str) -> Option<(i64, OptionType)> {
    let rest = symbol.strip_prefix("NIFTY")?.strip_prefix(expiry)?;
    let option_type = if rest.ends_with("CE") {
        OptionType::CE
    } else if rest.ends_with("PE") {
        OptionType::PE
    } else {
        return None;
    };
    let strike: i64 = rest[..rest.len() - 2].parse().ok()?;
    Some((strike, option_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_atm() {
        assert_eq!(round_to_atm(25963.0), 26000);
        assert_eq!(round_to_atm(25949.0), 25900);
        assert_eq!(round_to_atm(25950.0), 26000);
    }

    #[test]
    fn test_universe_size_and_contents() {
        let symbols = generate_option_symbols(26000, "30JAN25", 20, 50);
        // 41 strikes x 2 option types
        assert_eq!(symbols.len(), 82);
        assert!(symbols.contains(&"NIFTY30JAN2526000CE".to_string()));
        assert!(symbols.contains(&"NIFTY30JAN2525000PE".to_string()));
        assert!(symbols.contains(&"NIFTY30JAN2527000CE".to_string()));
    }

    #[test]
    fn test_parse_symbol_round_trip() {
        let (strike, option_type) = parse_symbol("NIFTY30JAN2526000CE", "30JAN25").unwrap();
        assert_eq!(strike, 26000);
        assert_eq!(option_type, OptionType::CE);

        assert!(parse_symbol("BANKNIFTY30JAN2526000CE", "30JAN25").is_none());
    }
}
