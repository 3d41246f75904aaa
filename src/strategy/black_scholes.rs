// =============================================================================
// Black-Scholes pricing and greeks for European options
// =============================================================================
//
//   d1 = (ln(S/K) + (r + sigma^2 / 2) T) / (sigma sqrt(T))
//   d2 = d1 - sigma sqrt(T)
//   call = S N(d1) - K e^{-rT} N(d2)
//   put  = K e^{-rT} N(-d2) - S N(-d1)
//
// The normal CDF uses the Abramowitz–Stegun rational approximation, accurate
// to ~7.5e-8 — far inside the tick size of any traded premium.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Call,
    Put,
}

/// Price and first-order greeks of one contract.
#[derive(Debug, Clone, Copy)]
pub struct OptionValue {
    pub price: f64,
    pub delta: f64,
    /// Per 1-point move in the underlying, per day.
    pub theta: f64,
    /// Per 1.0 change in vol (i.e. per 100 vol points).
    pub vega: f64,
    pub gamma: f64,
}

/// Standard normal CDF (Abramowitz & Stegun 26.2.17).
pub fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let tail = pdf * poly;
    if x >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Value a European option.
///
/// * `spot` — underlying price
/// * `strike` — contract strike
/// * `vol` — annualised implied volatility (e.g. 0.18)
/// * `rate` — annualised risk-free rate
/// * `years` — time to expiry in years
///
/// Returns `None` for non-positive spot/strike/vol or an expiry in the past.
pub fn value(
    kind: OptionKind,
    spot: f64,
    strike: f64,
    vol: f64,
    rate: f64,
    years: f64,
) -> Option<OptionValue> {
    if spot <= 0.0 || strike <= 0.0 || vol <= 0.0 {
        return None;
    }
    if years <= 0.0 {
        // Expired: intrinsic only, flat greeks.
        let intrinsic = match kind {
            OptionKind::Call => (spot - strike).max(0.0),
            OptionKind::Put => (strike - spot).max(0.0),
        };
        return Some(OptionValue {
            price: intrinsic,
            delta: 0.0,
            theta: 0.0,
            vega: 0.0,
            gamma: 0.0,
        });
    }

    let sqrt_t = years.sqrt();
    let d1 = ((spot / strike).ln() + (rate + vol * vol / 2.0) * years) / (vol * sqrt_t);
    let d2 = d1 - vol * sqrt_t;
    let discount = (-rate * years).exp();

    let (price, delta) = match kind {
        OptionKind::Call => (
            spot * norm_cdf(d1) - strike * discount * norm_cdf(d2),
            norm_cdf(d1),
        ),
        OptionKind::Put => (
            strike * discount * norm_cdf(-d2) - spot * norm_cdf(-d1),
            norm_cdf(d1) - 1.0,
        ),
    };

    let gamma = norm_pdf(d1) / (spot * vol * sqrt_t);
    let vega = spot * norm_pdf(d1) * sqrt_t;
    let theta_year = match kind {
        OptionKind::Call => {
            -spot * norm_pdf(d1) * vol / (2.0 * sqrt_t) - rate * strike * discount * norm_cdf(d2)
        }
        OptionKind::Put => {
            -spot * norm_pdf(d1) * vol / (2.0 * sqrt_t) + rate * strike * discount * norm_cdf(-d2)
        }
    };

    let result = OptionValue {
        price,
        delta,
        theta: theta_year / 365.0,
        vega,
        gamma,
    };
    result.price.is_finite().then_some(result)
}

/// Back out implied volatility from a market premium by bisection. Returns
/// `None` when the premium sits outside the model's reachable range.
pub fn implied_vol(
    kind: OptionKind,
    spot: f64,
    strike: f64,
    premium: f64,
    rate: f64,
    years: f64,
) -> Option<f64> {
    if premium <= 0.0 || years <= 0.0 {
        return None;
    }
    let (mut lo, mut hi) = (0.01_f64, 3.0_f64);
    let price_at = |vol: f64| value(kind, spot, strike, vol, rate, years).map(|v| v.price);

    if premium < price_at(lo)? || premium > price_at(hi)? {
        return None;
    }
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        let price = price_at(mid)?;
        if (price - premium).abs() < 1e-6 {
            return Some(mid);
        }
        if price < premium {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some((lo + hi) / 2.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_cdf_reference_points() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(1.0) - 0.8413447).abs() < 1e-6);
        assert!((norm_cdf(-1.0) - 0.1586553).abs() < 1e-6);
        assert!((norm_cdf(2.0) - 0.9772499).abs() < 1e-6);
    }

    #[test]
    fn call_put_parity_holds() {
        let (spot, strike, vol, rate, years) = (22_500.0, 22_500.0, 0.15, 0.065, 30.0 / 365.0);
        let call = value(OptionKind::Call, spot, strike, vol, rate, years).unwrap();
        let put = value(OptionKind::Put, spot, strike, vol, rate, years).unwrap();
        let parity = call.price - put.price - (spot - strike * (-rate * years).exp());
        assert!(parity.abs() < 1e-6, "parity violated by {parity}");
    }

    #[test]
    fn atm_call_delta_near_half() {
        let call = value(OptionKind::Call, 22_500.0, 22_500.0, 0.15, 0.065, 30.0 / 365.0).unwrap();
        assert!(call.delta > 0.5 && call.delta < 0.6, "delta {}", call.delta);
        assert!(call.theta < 0.0);
        assert!(call.vega > 0.0);
        assert!(call.gamma > 0.0);
    }

    #[test]
    fn deep_itm_call_approaches_intrinsic() {
        let call = value(OptionKind::Call, 25_000.0, 20_000.0, 0.15, 0.065, 7.0 / 365.0).unwrap();
        let intrinsic = 5000.0;
        assert!(call.price >= intrinsic);
        assert!(call.price < intrinsic + 120.0);
        assert!(call.delta > 0.99);
    }

    #[test]
    fn expired_option_is_intrinsic() {
        let call = value(OptionKind::Call, 110.0, 100.0, 0.2, 0.06, 0.0).unwrap();
        assert!((call.price - 10.0).abs() < 1e-12);
        let put = value(OptionKind::Put, 110.0, 100.0, 0.2, 0.06, 0.0).unwrap();
        assert!(put.price.abs() < 1e-12);
    }

    #[test]
    fn implied_vol_roundtrip() {
        let (spot, strike, rate, years) = (22_500.0, 22_600.0, 0.065, 14.0 / 365.0);
        let vol_in = 0.22;
        let premium = value(OptionKind::Call, spot, strike, vol_in, rate, years)
            .unwrap()
            .price;
        let vol_out = implied_vol(OptionKind::Call, spot, strike, premium, rate, years).unwrap();
        assert!((vol_out - vol_in).abs() < 1e-4, "got {vol_out}");
    }

    #[test]
    fn implied_vol_rejects_unreachable_premium() {
        assert!(implied_vol(OptionKind::Call, 100.0, 100.0, 95.0, 0.06, 0.1).is_none());
        assert!(implied_vol(OptionKind::Call, 100.0, 100.0, 0.0, 0.06, 0.1).is_none());
    }

    #[test]
    fn degenerate_inputs_rejected() {
        assert!(value(OptionKind::Call, 0.0, 100.0, 0.2, 0.06, 0.1).is_none());
        assert!(value(OptionKind::Call, 100.0, 100.0, 0.0, 0.06, 0.1).is_none());
    }
}
