//! Number-literal scanning.
//!
//! Numbers have the shape `[-+]R[rR]I.F[eE&][-+]X`: an optional sign, an
//! optional radix (2-36, written in base 10, or the C-style `0x` shorthand),
//! an integer part, a fractional part, and an exponent. `_` separators are
//! ignored anywhere between digits. The exponent marker is `&` in any radix
//! and additionally `e`/`E` in base 10 (where `e` is not a digit). A literal
//! with no decimal point and no downward exponent is an integer; anything
//! that does not fit 32 signed bits comes back as a real instead.
//!
//! The sign/radix prefix is recognized with nom; digit accumulation keeps the
//! mantissa in a `u64` and tracks a base-R exponent, converted to a double at
//! the end without going through intermediate rounding.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{digit1, one_of},
    combinator::{map_opt, opt, value},
    sequence::terminated,
};

use crate::value::Value;

struct Scan {
    mant: u64,
    ex: i32,
    seen_point: bool,
}

/// Optional radix marker: `0x` or `<base>r` with base 2-36.
fn radix_prefix(input: &str) -> IResult<&str, u32> {
    alt((
        value(16u32, tag_no_case("0x")),
        map_opt(terminated(digit1, one_of("rR")), |digits: &str| {
            digits.parse::<u32>().ok().filter(|r| (2..=36).contains(r))
        }),
    ))
    .parse(input)
}

/// Sign and radix prefix; returns (negative, base) and the digit body.
fn prefix(input: &str) -> IResult<&str, (bool, u32)> {
    let (input, sign) = opt(one_of("+-")).parse(input)?;
    let (input, radix) = opt(radix_prefix).parse(input)?;
    Ok((input, (sign == Some('-'), radix.unwrap_or(10))))
}

/// Accumulate mantissa and exponent from the digit body. Returns `None` on
/// any malformed input (double point, digit out of range for the base,
/// missing digits around the exponent marker).
fn scan_body(body: &str, base: u32) -> Option<Scan> {
    let bytes = body.as_bytes();

    // Reject absurd inputs outright so the exponent arithmetic cannot wrap
    if bytes.len() > (i32::MAX / 40) as usize {
        return None;
    }

    let mut mant: u64 = 0;
    let mut ex: i32 = 0;
    let mut seen_point = false;
    let mut found_exp = false;
    let mut seen_digit = false;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '.' {
            if seen_point {
                return None;
            }
            seen_point = true;
        } else if c == '&' || (base == 10 && (c == 'e' || c == 'E')) {
            found_exp = true;
            break;
        } else if c != '_' {
            let digit = c.to_digit(36)?;
            if digit >= base {
                return None;
            }
            if seen_point {
                ex -= 1;
            }
            // Once the mantissa would lose precision, drop digits and track
            // the magnitude in the exponent instead
            if mant > 0x00ff_ffff_ffff_ffff {
                ex += 1;
            } else {
                mant = base as u64 * mant + digit as u64;
            }
            seen_digit = true;
        }
        i += 1;
    }

    if !seen_digit {
        return None;
    }

    if found_exp {
        i += 1;
        if i >= bytes.len() {
            return None;
        }
        let mut exp_negative = false;
        match bytes[i] {
            b'-' => {
                exp_negative = true;
                i += 1;
            }
            b'+' => i += 1,
            _ => {}
        }
        let mut ee: i32 = 0;
        seen_digit = false;
        // Exponent digits are read in the literal's own radix
        while i < bytes.len() && ee < i32::MAX / 40 {
            let c = bytes[i] as char;
            if c == '_' {
                i += 1;
                continue;
            }
            let digit = c.to_digit(36)?;
            if digit >= base {
                return None;
            }
            ee = base as i32 * ee + digit as i32;
            seen_digit = true;
            i += 1;
        }
        if !seen_digit {
            return None;
        }
        ex += if exp_negative { -ee } else { ee };
    }

    Some(Scan {
        mant,
        ex,
        seen_point,
    })
}

/// Multiply a f64 by 2^e in steps that survive the subnormal range.
fn scale2(mut x: f64, mut e: i32) -> f64 {
    while e > 1000 {
        x *= 2f64.powi(1000);
        e -= 1000;
    }
    while e < -1000 {
        x *= 2f64.powi(-1000);
        e += 1000;
    }
    x * 2f64.powi(e)
}

/// Convert an accumulated mantissa and base-R exponent to a double by
/// rebasing the exponent onto powers of two, keeping the mantissa as wide
/// as possible at every step.
fn convert(negative: bool, mantissa: u64, base: u32, exponent: i32) -> f64 {
    if mantissa == 0 {
        return 0.0;
    }
    if exponent > 1022 {
        return if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let base = base as u64;
    let mut mantissa = mantissa;
    let mut exponent = exponent;
    let mut exponent2: i32 = 0;

    if exponent > 0 {
        while mantissa <= 0x03ff_ffff_ffff_ffff && exponent > 0 {
            mantissa *= base;
            exponent -= 1;
        }
        while exponent > 0 {
            // Keep 6 bits of headroom: the largest base is 36
            mantissa >>= 1;
            exponent2 += 1;
            if mantissa <= 0x03ff_ffff_ffff_ffff {
                mantissa *= base;
                exponent -= 1;
            }
        }
    } else {
        while exponent < 0 {
            mantissa <<= 1;
            exponent2 -= 1;
            if mantissa > 0x7fff_ffff_ffff_ffff {
                mantissa /= base;
                exponent += 1;
            }
        }
    }

    let magnitude = scale2(mantissa as f64, exponent2);
    if negative { -magnitude } else { magnitude }
}

fn integer_from(scan: &Scan, negative: bool, base: u32) -> Option<i32> {
    if scan.seen_point || scan.ex < 0 {
        return None;
    }
    let mut wide: i64 = scan.mant as i64;
    if negative {
        wide = -wide;
    }
    let mut ex = scan.ex;
    while ex > 0 {
        wide = wide.checked_mul(base as i64)?;
        if wide > i32::MAX as i64 || wide < i32::MIN as i64 {
            return None;
        }
        ex -= 1;
    }
    if wide > i32::MAX as i64 || wide < i32::MIN as i64 {
        return None;
    }
    Some(wide as i32)
}

/// Scan a complete numeric token. Returns `None` when the token is not a
/// well-formed number; integers that do not fit in 32 signed bits are
/// demoted to reals.
pub fn scan_number(token: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(token).ok()?;
    let (body, (negative, base)) = prefix(text).ok()?;
    let scan = scan_body(body, base)?;
    if let Some(i) = integer_from(&scan, negative, base) {
        return Some(Value::Integer(i));
    }
    Some(Value::Real(convert(negative, scan.mant, base, scan.ex)))
}
