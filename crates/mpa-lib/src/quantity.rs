//! Conversions between Kubernetes quantity strings and integer resource amounts
//!
//! CPU amounts are whole millicores and memory amounts whole bytes. Parsing is
//! exact: inputs that do not land on that grain are reported as errors by the
//! strict parsers and rounded up by the lenient ones, matching how the API
//! server rounds quantities.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{ResourceAmount, ResourceName, Resources};

/// Exact rational value of a parsed quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rational {
    num: i128,
    den: i128,
}

impl Rational {
    fn scaled_by(self, factor: i128) -> Option<i128> {
        let n = self.num.checked_mul(factor)?;
        Some(n / self.den)
    }

    fn is_multiple_at(self, factor: i128) -> bool {
        match self.num.checked_mul(factor) {
            Some(n) => n % self.den == 0,
            None => false,
        }
    }

    fn ceil_at(self, factor: i128) -> Option<i128> {
        let n = self.num.checked_mul(factor)?;
        let q = n / self.den;
        if n % self.den != 0 && n > 0 {
            Some(q + 1)
        } else {
            Some(q)
        }
    }
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

fn parse_rational(input: &str) -> Result<Rational> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::quantity("empty quantity"));
    }

    let (negative, rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(number_end);
    if number.is_empty() || number == "." {
        return Err(Error::quantity(format!("invalid quantity {:?}", input)));
    }

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let frac = parts.next().unwrap_or("");
    if frac.contains('.') {
        return Err(Error::quantity(format!("invalid quantity {:?}", input)));
    }

    let digits = format!("{}{}", whole, frac);
    let mut num: i128 = digits
        .parse()
        .map_err(|_| Error::quantity(format!("invalid quantity {:?}", input)))?;
    let mut den: i128 = pow10(frac.len() as u32)
        .ok_or_else(|| Error::quantity(format!("too many digits in {:?}", input)))?;

    let overflow = || Error::quantity(format!("quantity {:?} out of range", input));

    match suffix {
        "" => {}
        "Ki" => num = num.checked_mul(1 << 10).ok_or_else(overflow)?,
        "Mi" => num = num.checked_mul(1 << 20).ok_or_else(overflow)?,
        "Gi" => num = num.checked_mul(1 << 30).ok_or_else(overflow)?,
        "Ti" => num = num.checked_mul(1 << 40).ok_or_else(overflow)?,
        "Pi" => num = num.checked_mul(1 << 50).ok_or_else(overflow)?,
        "Ei" => num = num.checked_mul(1 << 60).ok_or_else(overflow)?,
        "n" => den = den.checked_mul(1_000_000_000).ok_or_else(overflow)?,
        "u" => den = den.checked_mul(1_000_000).ok_or_else(overflow)?,
        "m" => den = den.checked_mul(1_000).ok_or_else(overflow)?,
        "k" => num = num.checked_mul(1_000).ok_or_else(overflow)?,
        "M" => num = num.checked_mul(1_000_000).ok_or_else(overflow)?,
        "G" => num = num.checked_mul(1_000_000_000).ok_or_else(overflow)?,
        "T" => num = num.checked_mul(1_000_000_000_000).ok_or_else(overflow)?,
        "P" => num = num.checked_mul(1_000_000_000_000_000).ok_or_else(overflow)?,
        "E" => num = num.checked_mul(1_000_000_000_000_000_000).ok_or_else(overflow)?,
        other if other.starts_with('e') || other.starts_with('E') => {
            let exp: i32 = other[1..]
                .parse()
                .map_err(|_| Error::quantity(format!("invalid exponent in {:?}", input)))?;
            let factor = pow10(exp.unsigned_abs()).ok_or_else(overflow)?;
            if exp >= 0 {
                num = num.checked_mul(factor).ok_or_else(overflow)?;
            } else {
                den = den.checked_mul(factor).ok_or_else(overflow)?;
            }
        }
        other => {
            return Err(Error::quantity(format!(
                "unknown suffix {:?} in {:?}",
                other, input
            )))
        }
    }

    if negative {
        num = -num;
    }
    Ok(Rational { num, den })
}

fn to_i64(v: i128, input: &str) -> Result<i64> {
    i64::try_from(v).map_err(|_| Error::quantity(format!("quantity {:?} out of range", input)))
}

/// Parse a CPU quantity into whole millicores, rejecting finer-grained values
pub fn parse_cpu_strict(input: &str) -> Result<ResourceAmount> {
    let r = parse_rational(input)?;
    if !r.is_multiple_at(1000) {
        return Err(Error::quantity(format!(
            "cpu quantity {:?} is finer than one millicore",
            input
        )));
    }
    let millis = r
        .scaled_by(1000)
        .ok_or_else(|| Error::quantity(format!("quantity {:?} out of range", input)))?;
    Ok(ResourceAmount(to_i64(millis, input)?))
}

/// Parse a memory quantity into whole bytes, rejecting fractional bytes
pub fn parse_memory_strict(input: &str) -> Result<ResourceAmount> {
    let r = parse_rational(input)?;
    if !r.is_multiple_at(1) {
        return Err(Error::quantity(format!(
            "memory quantity {:?} is not a whole number of bytes",
            input
        )));
    }
    Ok(ResourceAmount(to_i64(r.num / r.den, input)?))
}

/// Parse a quantity of the given resource, rejecting finer-grained values
pub fn parse_strict(resource: ResourceName, input: &str) -> Result<ResourceAmount> {
    match resource {
        ResourceName::Cpu => parse_cpu_strict(input),
        ResourceName::Memory => parse_memory_strict(input),
    }
}

/// Parse a quantity of the given resource, rounding up to the integer grain
pub fn parse_lenient(resource: ResourceName, input: &str) -> Result<ResourceAmount> {
    let r = parse_rational(input)?;
    let factor = match resource {
        ResourceName::Cpu => 1000,
        ResourceName::Memory => 1,
    };
    let v = r
        .ceil_at(factor)
        .ok_or_else(|| Error::quantity(format!("quantity {:?} out of range", input)))?;
    Ok(ResourceAmount(to_i64(v, input)?))
}

/// Canonical string for an amount of the given resource
pub fn format_amount(resource: ResourceName, amount: ResourceAmount) -> String {
    match resource {
        ResourceName::Cpu => format_cpu(amount),
        ResourceName::Memory => format_memory(amount),
    }
}

/// `250m`, or `2` for whole cores
pub fn format_cpu(amount: ResourceAmount) -> String {
    let millis = amount.0;
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{}m", millis)
    }
}

/// `200Mi` when the byte count lands on a binary suffix, plain bytes otherwise
pub fn format_memory(amount: ResourceAmount) -> String {
    const SUFFIXES: [(&str, i64); 6] = [
        ("Ei", 1 << 60),
        ("Pi", 1 << 50),
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];
    let bytes = amount.0;
    if bytes != 0 {
        for (suffix, size) in SUFFIXES {
            if bytes % size == 0 {
                return format!("{}{}", bytes / size, suffix);
            }
        }
    }
    format!("{}", bytes)
}

/// Quantity for an amount of the given resource
pub fn to_quantity(resource: ResourceName, amount: ResourceAmount) -> Quantity {
    Quantity(format_amount(resource, amount))
}

/// Convert a Kubernetes resource list into [`Resources`], keeping CPU and
/// memory only and rounding up to the integer grain
pub fn resources_from_list(list: &BTreeMap<String, Quantity>) -> Resources {
    let mut out = Resources::new();
    for (name, quantity) in list {
        if let Some(resource) = ResourceName::parse(name) {
            if let Ok(amount) = parse_lenient(resource, &quantity.0) {
                out.insert(resource, amount);
            }
        }
    }
    out
}

/// Like [`resources_from_list`] but fails on finer-grained quantities
pub fn resources_from_list_strict(list: &BTreeMap<String, Quantity>) -> Result<Resources> {
    let mut out = Resources::new();
    for (name, quantity) in list {
        if let Some(resource) = ResourceName::parse(name) {
            out.insert(resource, parse_strict(resource, &quantity.0)?);
        }
    }
    Ok(out)
}

/// Convert [`Resources`] into a Kubernetes resource list
pub fn resources_to_list(resources: &Resources) -> BTreeMap<String, Quantity> {
    resources
        .iter()
        .map(|(name, amount)| (name.as_str().to_string(), to_quantity(*name, *amount)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu_strict("250m").unwrap(), ResourceAmount(250));
        assert_eq!(parse_cpu_strict("1").unwrap(), ResourceAmount(1000));
        assert_eq!(parse_cpu_strict("1.5").unwrap(), ResourceAmount(1500));
        assert_eq!(parse_cpu_strict("0.1").unwrap(), ResourceAmount(100));
        assert_eq!(parse_cpu_strict("2e-1").unwrap(), ResourceAmount(200));
    }

    #[test]
    fn test_parse_cpu_rejects_sub_millicore() {
        assert!(parse_cpu_strict("0.5m").is_err());
        assert!(parse_cpu_strict("100u").is_err());
        assert!(parse_cpu_strict("0.0001").is_err());
        assert_eq!(
            parse_lenient(ResourceName::Cpu, "0.5m").unwrap(),
            ResourceAmount(1)
        );
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory_strict("100Mi").unwrap(), ResourceAmount(100 << 20));
        assert_eq!(parse_memory_strict("1Gi").unwrap(), ResourceAmount(1 << 30));
        assert_eq!(parse_memory_strict("1k").unwrap(), ResourceAmount(1000));
        assert_eq!(parse_memory_strict("128974848").unwrap(), ResourceAmount(128974848));
        assert_eq!(parse_memory_strict("1.5Ki").unwrap(), ResourceAmount(1536));
    }

    #[test]
    fn test_parse_memory_rejects_fractional_bytes() {
        assert!(parse_memory_strict("100m").is_err());
        assert!(parse_memory_strict("0.5").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpu_strict("").is_err());
        assert!(parse_cpu_strict("abc").is_err());
        assert!(parse_cpu_strict("1.2.3").is_err());
        assert!(parse_memory_strict("10Xi").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_cpu(ResourceAmount(250)), "250m");
        assert_eq!(format_cpu(ResourceAmount(2000)), "2");
        assert_eq!(format_memory(ResourceAmount(200 << 20)), "200Mi");
        assert_eq!(format_memory(ResourceAmount(1 << 30)), "1Gi");
        assert_eq!(format_memory(ResourceAmount(1000)), "1000");
        assert_eq!(format_memory(ResourceAmount(0)), "0");
    }

    #[test]
    fn test_resource_list_conversion() {
        let mut list = BTreeMap::new();
        list.insert("cpu".to_string(), Quantity("100m".to_string()));
        list.insert("memory".to_string(), Quantity("100Mi".to_string()));
        list.insert("nvidia.com/gpu".to_string(), Quantity("1".to_string()));

        let res = resources_from_list(&list);
        assert_eq!(res.len(), 2);
        assert_eq!(res[&ResourceName::Cpu], ResourceAmount(100));

        let back = resources_to_list(&res);
        assert_eq!(back["cpu"].0, "100m");
        assert_eq!(back["memory"].0, "100Mi");
    }

    #[test]
    fn test_strict_list_conversion_fails_on_fine_grain() {
        let mut list = BTreeMap::new();
        list.insert("cpu".to_string(), Quantity("0.5m".to_string()));
        assert!(resources_from_list_strict(&list).is_err());
    }
}
