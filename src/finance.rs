//! Financial formulas offered to the calculation workers
//!
//! Rates are taken in percent (6 means 6%), like the users type them.
//! Every function validates its inputs and returns `InvalidToolInput` on a
//! contract violation.

use crate::error::OrchestrationError;
use crate::llm::ToolDeclaration;
use crate::models::{ParamKind, ParamSpec, ToolSpec};
use crate::Result;
use serde_json::{json, Map, Value};

fn invalid(msg: String) -> OrchestrationError {
    OrchestrationError::InvalidToolInput(msg)
}

fn positive(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(invalid(format!("{} must be greater than zero, got {}", name, value)))
    }
}

fn percent(name: &str, value: f64, max: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=max).contains(&value) {
        Ok(value / 100.0)
    } else {
        Err(invalid(format!("{} must be between 0 and {}%, got {}", name, max, value)))
    }
}

// ===== Formulas =====

/// 100 years of monthly coupons
pub const MAX_BOND_PERIODS: u32 = 1200;

/// Present value of a plain coupon bond
pub fn bond_value(face: f64, coupon_pct: f64, ytm_pct: f64, years: u32, frequency: u32) -> Result<f64> {
    let face = positive("face_value", face)?;
    let coupon = percent("coupon_rate", coupon_pct, 100.0)?;
    let ytm = percent("discount_rate", ytm_pct, 100.0)?;
    if years == 0 || frequency == 0 {
        return Err(invalid("years and frequency must be positive integers".to_string()));
    }

    let periods = years
        .checked_mul(frequency)
        .filter(|p| *p <= MAX_BOND_PERIODS)
        .ok_or_else(|| {
            invalid(format!(
                "years x frequency must not exceed {} coupon periods, got {} x {}",
                MAX_BOND_PERIODS, years, frequency
            ))
        })?;
    let exponent = i32::try_from(periods)
        .map_err(|_| invalid(format!("{} coupon periods is out of range", periods)))?;
    let payment = face * coupon / f64::from(frequency);
    let rate = ytm / f64::from(frequency);

    if rate == 0.0 {
        return Ok(payment * f64::from(periods) + face);
    }

    let coupons: f64 = (1..=exponent)
        .map(|t| payment / (1.0 + rate).powi(t))
        .sum();
    Ok(coupons + face / (1.0 + rate).powi(exponent))
}

/// Net present value; cash flows start one period after the investment
pub fn net_present_value(rate_pct: f64, initial_investment: f64, cash_flows: &[f64]) -> Result<f64> {
    let rate = percent("discount_rate", rate_pct, 100.0)?;
    let initial = positive("initial_investment", initial_investment)?;
    if cash_flows.is_empty() {
        return Err(invalid("cash_flows must contain at least one value".to_string()));
    }
    if cash_flows.iter().any(|cf| !cf.is_finite()) {
        return Err(invalid("cash_flows must be finite numbers".to_string()));
    }

    let discounted: f64 = cash_flows
        .iter()
        .enumerate()
        .map(|(i, cf)| cf / (1.0 + rate).powi(i as i32 + 1))
        .sum();
    Ok(discounted - initial)
}

/// Weighted average cost of capital, in percent
pub fn wacc(tax_pct: f64, cost_of_debt_pct: f64, cost_of_equity_pct: f64, debt: f64, equity: f64) -> Result<f64> {
    let tax = percent("tax_rate", tax_pct, 100.0)?;
    let kd = percent("cost_of_debt", cost_of_debt_pct, 100.0)?;
    let ke = percent("cost_of_equity", cost_of_equity_pct, 100.0)?;
    let debt = positive("debt_value", debt)?;
    let equity = positive("equity_value", equity)?;

    let total = debt + equity;
    Ok((equity / total * ke + debt / total * kd * (1.0 - tax)) * 100.0)
}

/// Cost of equity by CAPM, in percent
pub fn capm(risk_free_pct: f64, beta: f64, market_return_pct: f64) -> Result<f64> {
    let rf = percent("risk_free_rate", risk_free_pct, 100.0)?;
    let beta = positive("beta", beta)?;
    let rm = percent("market_return", market_return_pct, 100.0)?;
    Ok((rf + beta * (rm - rf)) * 100.0)
}

pub fn sharpe_ratio(portfolio_return_pct: f64, risk_free_pct: f64, std_dev_pct: f64) -> Result<f64> {
    let rp = percent("portfolio_return", portfolio_return_pct, 100.0)?;
    let rf = percent("risk_free_rate", risk_free_pct, 100.0)?;
    let sd = percent("std_dev", std_dev_pct, 200.0)?;
    if sd == 0.0 {
        return Err(invalid("std_dev must be greater than zero".to_string()));
    }
    Ok((rp - rf) / sd)
}

/// Gordon growth model share value. Requires Ke > g.
pub fn gordon_growth(next_dividend: f64, cost_of_equity_pct: f64, growth_pct: f64) -> Result<f64> {
    let d1 = positive("next_dividend", next_dividend)?;
    let ke = percent("cost_of_equity", cost_of_equity_pct, 100.0)?;
    let g = percent("growth_rate", growth_pct, 100.0)?;
    if ke <= g {
        return Err(invalid(format!(
            "cost_of_equity ({}%) must exceed growth_rate ({}%)",
            cost_of_equity_pct, growth_pct
        )));
    }
    Ok(d1 / (ke - g))
}

/// European call price by Black-Scholes
pub fn black_scholes_call(spot: f64, strike: f64, years: f64, rate_pct: f64, sigma_pct: f64) -> Result<f64> {
    let s = positive("spot", spot)?;
    let k = positive("strike", strike)?;
    let t = positive("time_to_expiry", years)?;
    let r = percent("risk_free_rate", rate_pct, 100.0)?;
    let sigma = percent("volatility", sigma_pct, 200.0)?;
    if sigma == 0.0 {
        return Err(invalid("volatility must be greater than zero".to_string()));
    }

    let vol_sqrt_t = sigma * t.sqrt();
    let d1 = ((s / k).ln() + (r + sigma * sigma / 2.0) * t) / vol_sqrt_t;
    let d2 = d1 - vol_sqrt_t;
    Ok(s * normal_cdf(d1) - k * (-r * t).exp() * normal_cdf(d2))
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

// ===== Tool surface =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinanceTool {
    BondValue,
    NetPresentValue,
    Wacc,
    GordonGrowth,
    Capm,
    SharpeRatio,
    BlackScholesCall,
}

impl FinanceTool {
    pub const ALL: [FinanceTool; 7] = [
        FinanceTool::BondValue,
        FinanceTool::NetPresentValue,
        FinanceTool::Wacc,
        FinanceTool::GordonGrowth,
        FinanceTool::Capm,
        FinanceTool::SharpeRatio,
        FinanceTool::BlackScholesCall,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FinanceTool::BondValue => "bond_value",
            FinanceTool::NetPresentValue => "npv",
            FinanceTool::Wacc => "wacc",
            FinanceTool::GordonGrowth => "gordon_growth",
            FinanceTool::Capm => "capm",
            FinanceTool::SharpeRatio => "sharpe_ratio",
            FinanceTool::BlackScholesCall => "black_scholes_call",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            FinanceTool::BondValue => "Present value of a coupon bond",
            FinanceTool::NetPresentValue => "Net present value of a project",
            FinanceTool::Wacc => "Weighted average cost of capital",
            FinanceTool::GordonGrowth => "Share value by the Gordon growth (constant dividend growth) model",
            FinanceTool::Capm => "Cost of equity by CAPM",
            FinanceTool::SharpeRatio => "Sharpe ratio of a portfolio",
            FinanceTool::BlackScholesCall => "European call option price by Black-Scholes",
        }
    }

    pub fn params(&self) -> Vec<ParamSpec> {
        use ParamKind::*;
        let p = ParamSpec::new;
        match self {
            FinanceTool::BondValue => vec![
                p("face_value", Number, "Face (nominal) value"),
                p("coupon_rate", Percentage, "Annual coupon rate in %"),
                p("discount_rate", Percentage, "Annual market yield (YTM) in %"),
                p("years", Integer, "Years to maturity"),
                p("frequency", Integer, "Coupon payments per year"),
            ],
            FinanceTool::NetPresentValue => vec![
                p("discount_rate", Percentage, "Discount rate in %"),
                p("initial_investment", Number, "Initial outlay as a positive number"),
                p("cash_flows", List, "Future cash flows, one per period"),
            ],
            FinanceTool::Wacc => vec![
                p("tax_rate", Percentage, "Corporate tax rate in %"),
                p("cost_of_debt", Percentage, "Cost of debt in %"),
                p("cost_of_equity", Percentage, "Cost of equity in %"),
                p("debt_value", Number, "Market value of debt"),
                p("equity_value", Number, "Market value of equity"),
            ],
            FinanceTool::GordonGrowth => vec![
                p("next_dividend", Number, "Dividend expected next period (D1)"),
                p("cost_of_equity", Percentage, "Required return on equity (Ke) in %"),
                p("growth_rate", Percentage, "Constant dividend growth rate (g) in %"),
            ],
            FinanceTool::Capm => vec![
                p("risk_free_rate", Percentage, "Risk-free rate in %"),
                p("beta", Number, "Asset beta"),
                p("market_return", Percentage, "Expected market return in %"),
            ],
            FinanceTool::SharpeRatio => vec![
                p("portfolio_return", Percentage, "Expected portfolio return in %"),
                p("risk_free_rate", Percentage, "Risk-free rate in %"),
                p("std_dev", Percentage, "Portfolio standard deviation in %"),
            ],
            FinanceTool::BlackScholesCall => vec![
                p("spot", Number, "Current price of the underlying"),
                p("strike", Number, "Strike price"),
                p("time_to_expiry", Number, "Time to expiry in years"),
                p("risk_free_rate", Percentage, "Annual risk-free rate in %"),
                p("volatility", Percentage, "Annual volatility in %"),
            ],
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            params: self.params(),
        }
    }

    /// Function declaration with a JSON schema for the arguments
    pub fn declaration(&self) -> ToolDeclaration {
        let params = self.params();
        let mut properties = Map::new();
        for param in &params {
            let schema = match param.kind {
                ParamKind::Number | ParamKind::Percentage => {
                    json!({ "type": "number", "description": param.description })
                }
                ParamKind::Integer => json!({ "type": "integer", "description": param.description }),
                ParamKind::List => json!({
                    "type": "array",
                    "items": { "type": "number" },
                    "description": param.description
                }),
            };
            properties.insert(param.name.clone(), schema);
        }
        let required: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();

        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Names of required arguments that are absent or null
    pub fn missing_params(&self, args: &Value) -> Vec<String> {
        self.params()
            .into_iter()
            .filter(|p| args.get(&p.name).map_or(true, Value::is_null))
            .map(|p| p.name)
            .collect()
    }

    pub fn evaluate(&self, args: &Value) -> Result<f64> {
        match self {
            FinanceTool::BondValue => bond_value(
                number(args, "face_value")?,
                number(args, "coupon_rate")?,
                number(args, "discount_rate")?,
                integer(args, "years")?,
                integer(args, "frequency")?,
            ),
            FinanceTool::NetPresentValue => net_present_value(
                number(args, "discount_rate")?,
                number(args, "initial_investment")?,
                &list(args, "cash_flows")?,
            ),
            FinanceTool::Wacc => wacc(
                number(args, "tax_rate")?,
                number(args, "cost_of_debt")?,
                number(args, "cost_of_equity")?,
                number(args, "debt_value")?,
                number(args, "equity_value")?,
            ),
            FinanceTool::GordonGrowth => gordon_growth(
                number(args, "next_dividend")?,
                number(args, "cost_of_equity")?,
                number(args, "growth_rate")?,
            ),
            FinanceTool::Capm => capm(
                number(args, "risk_free_rate")?,
                number(args, "beta")?,
                number(args, "market_return")?,
            ),
            FinanceTool::SharpeRatio => sharpe_ratio(
                number(args, "portfolio_return")?,
                number(args, "risk_free_rate")?,
                number(args, "std_dev")?,
            ),
            FinanceTool::BlackScholesCall => black_scholes_call(
                number(args, "spot")?,
                number(args, "strike")?,
                number(args, "time_to_expiry")?,
                number(args, "risk_free_rate")?,
                number(args, "volatility")?,
            ),
        }
    }

    pub fn format_result(&self, value: f64) -> String {
        match self {
            FinanceTool::BondValue => format!("Bond value: {:.2}", value),
            FinanceTool::NetPresentValue => {
                let verdict = if value >= 0.0 { "accept" } else { "reject" };
                format!("NPV: {:.2} ({} the project)", value, verdict)
            }
            FinanceTool::Wacc => format!("WACC: {:.2}%", value),
            FinanceTool::GordonGrowth => format!("Share value (Gordon growth): {:.2}", value),
            FinanceTool::Capm => format!("Cost of equity (CAPM): {:.2}%", value),
            FinanceTool::SharpeRatio => format!("Sharpe ratio: {:.4}", value),
            FinanceTool::BlackScholesCall => format!("Call option value (Black-Scholes): {:.4}", value),
        }
    }
}

// ===== Argument parsing =====

fn parse_number_str(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().replace(',', "").parse().ok()
}

fn number(args: &Value, key: &str) -> Result<f64> {
    let parsed = match args.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_number_str(s),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(format!("{} must be a number", key)))
}

fn integer(args: &Value, key: &str) -> Result<u32> {
    let value = number(args, key)?;
    if value.fract() != 0.0 || value < 1.0 || value > f64::from(u32::MAX) {
        return Err(invalid(format!("{} must be a positive integer, got {}", key, value)));
    }
    Ok(value as u32)
}

fn list(args: &Value, key: &str) -> Result<Vec<f64>> {
    let parse_item = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number_str(s),
        _ => None,
    };

    let items: Option<Vec<f64>> = match args.get(key) {
        Some(Value::Array(items)) => items.iter().map(parse_item).collect(),
        Some(Value::String(s)) => s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split([',', ';'])
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.trim().parse::<f64>().ok())
            .collect(),
        _ => None,
    };

    items.ok_or_else(|| invalid(format!("{} must be a list of numbers", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_bond_at_par() {
        let v = bond_value(1000.0, 5.0, 5.0, 10, 1).unwrap();
        assert!(close(v, 1000.0, 1e-6));
    }

    #[test]
    fn test_bond_period_overflow_is_invalid_input() {
        let args = json!({
            "face_value": 1000,
            "coupon_rate": 5,
            "discount_rate": 6,
            "years": 100000,
            "frequency": 100000
        });
        let err = FinanceTool::BondValue.evaluate(&args).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidToolInput(_)));

        // just past the cap
        let err = bond_value(1000.0, 5.0, 6.0, 101, 12).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidToolInput(_)));
        assert!(bond_value(1000.0, 5.0, 6.0, 100, 12).is_ok());
    }

    #[test]
    fn test_npv_reference_case() {
        let v = net_present_value(10.0, 100_000.0, &[30_000.0, 40_000.0, 50_000.0]).unwrap();
        assert!(close(v, -2103.68, 0.01));
    }

    #[test]
    fn test_wacc_capm_sharpe() {
        assert!(close(wacc(30.0, 8.0, 12.0, 400.0, 600.0).unwrap(), 9.44, 1e-9));
        assert!(close(capm(3.0, 1.2, 8.0).unwrap(), 9.0, 1e-9));
        assert!(close(sharpe_ratio(12.0, 3.0, 15.0).unwrap(), 0.6, 1e-9));
    }

    #[test]
    fn test_gordon_requires_ke_above_g() {
        assert!(close(gordon_growth(2.0, 10.0, 4.0).unwrap(), 33.3333, 1e-3));
        assert!(matches!(
            gordon_growth(2.0, 4.0, 4.0),
            Err(OrchestrationError::InvalidToolInput(_))
        ));
    }

    #[test]
    fn test_black_scholes_reference() {
        let c = black_scholes_call(100.0, 100.0, 1.0, 5.0, 20.0).unwrap();
        assert!(close(c, 10.4506, 1e-3));
        assert!(black_scholes_call(100.0, 100.0, 1.0, 5.0, 0.0).is_err());
    }

    #[test]
    fn test_missing_params_and_lenient_parsing() {
        let args = json!({ "discount_rate": "10%", "cash_flows": "[30000, 40000, 50000]" });
        let tool = FinanceTool::NetPresentValue;
        assert_eq!(tool.missing_params(&args), vec!["initial_investment".to_string()]);

        let args = json!({
            "discount_rate": "10%",
            "initial_investment": "100,000",
            "cash_flows": "[30000, 40000, 50000]"
        });
        assert!(tool.missing_params(&args).is_empty());
        assert!(close(tool.evaluate(&args).unwrap(), -2103.68, 0.01));
    }

    #[test]
    fn test_declaration_schema() {
        let decl = FinanceTool::Wacc.declaration();
        assert_eq!(decl.name, "wacc");
        assert_eq!(decl.parameters["required"].as_array().unwrap().len(), 5);
        assert_eq!(decl.parameters["properties"]["tax_rate"]["type"], "number");
    }

    #[test]
    fn test_integer_parameters_rejected_when_fractional() {
        let args = json!({
            "face_value": 1000, "coupon_rate": 5, "discount_rate": 5,
            "years": 2.5, "frequency": 1
        });
        assert!(FinanceTool::BondValue.evaluate(&args).is_err());
    }
}
