//! Host implementations of pure core-library methods.
//!
//! These run only when every argument is a constant; the engine otherwise
//! keeps the call symbolic. Instance methods receive the receiver first.

use crate::constant::Constant;
use crate::error::HostError;

fn arg(args: &[Constant], i: usize) -> Result<&Constant, HostError> {
    args.get(i)
        .ok_or_else(|| HostError(format!("missing argument {i}")))
}

fn int(args: &[Constant], i: usize) -> Result<i64, HostError> {
    arg(args, i)?
        .as_i64()
        .ok_or_else(|| HostError(format!("argument {i} is not an integer")))
}

fn string(args: &[Constant], i: usize) -> Result<Option<&str>, HostError> {
    match arg(args, i)? {
        Constant::Null => Ok(None),
        Constant::Str(s) => Ok(Some(s)),
        other => Err(HostError(format!("argument {i} is not a string: {other}"))),
    }
}

fn non_null<'a>(s: Option<&'a str>) -> Result<&'a str, HostError> {
    s.ok_or_else(|| HostError("null string receiver".to_string()))
}

pub fn math_abs_i32(args: &[Constant]) -> Result<Constant, HostError> {
    let v = int(args, 0)? as i32;
    v.checked_abs()
        .map(Constant::I32)
        .ok_or_else(|| HostError("Math.Abs overflow".to_string()))
}

pub fn math_abs_i64(args: &[Constant]) -> Result<Constant, HostError> {
    int(args, 0)?
        .checked_abs()
        .map(Constant::I64)
        .ok_or_else(|| HostError("Math.Abs overflow".to_string()))
}

pub fn math_abs_f64(args: &[Constant]) -> Result<Constant, HostError> {
    let v = arg(args, 0)?
        .as_f64()
        .ok_or_else(|| HostError("argument 0 is not a float".to_string()))?;
    Ok(Constant::F64(v.abs()))
}

pub fn math_max_i32(args: &[Constant]) -> Result<Constant, HostError> {
    Ok(Constant::I32(int(args, 0)?.max(int(args, 1)?) as i32))
}

pub fn math_min_i32(args: &[Constant]) -> Result<Constant, HostError> {
    Ok(Constant::I32(int(args, 0)?.min(int(args, 1)?) as i32))
}

pub fn string_concat(args: &[Constant]) -> Result<Constant, HostError> {
    let a = string(args, 0)?.unwrap_or("");
    let b = string(args, 1)?.unwrap_or("");
    Ok(Constant::str(&format!("{a}{b}")))
}

pub fn string_length(args: &[Constant]) -> Result<Constant, HostError> {
    let s = non_null(string(args, 0)?)?;
    Ok(Constant::I32(s.encode_utf16().count() as i32))
}

pub fn string_equals(args: &[Constant]) -> Result<Constant, HostError> {
    Ok(Constant::Bool(string(args, 0)? == string(args, 1)?))
}

pub fn string_is_null_or_empty(args: &[Constant]) -> Result<Constant, HostError> {
    Ok(Constant::Bool(string(args, 0)?.is_none_or(str::is_empty)))
}

/// `new string(c, count)`.
pub fn string_repeat(args: &[Constant]) -> Result<Constant, HostError> {
    let Constant::Char(c) = arg(args, 0)? else {
        return Err(HostError("argument 0 is not a char".to_string()));
    };
    let count = usize::try_from(int(args, 1)?)
        .map_err(|_| HostError("negative repeat count".to_string()))?;
    let c = char::from_u32(*c as u32)
        .ok_or_else(|| HostError("unpaired surrogate".to_string()))?;
    Ok(Constant::str(&c.to_string().repeat(count)))
}

pub fn int32_to_string(args: &[Constant]) -> Result<Constant, HostError> {
    Ok(Constant::str(&(int(args, 0)? as i32).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs() {
        assert_eq!(math_abs_i32(&[Constant::I32(-5)]), Ok(Constant::I32(5)));
        assert!(math_abs_i32(&[Constant::I32(i32::MIN)]).is_err());
        assert_eq!(math_abs_f64(&[Constant::F64(-1.5)]), Ok(Constant::F64(1.5)));
    }

    #[test]
    fn min_max() {
        let args = [Constant::I32(3), Constant::I32(-2)];
        assert_eq!(math_max_i32(&args), Ok(Constant::I32(3)));
        assert_eq!(math_min_i32(&args), Ok(Constant::I32(-2)));
    }

    #[test]
    fn concat_treats_null_as_empty() {
        assert_eq!(
            string_concat(&[Constant::str("ab"), Constant::Null]),
            Ok(Constant::str("ab"))
        );
    }

    #[test]
    fn string_predicates() {
        assert_eq!(string_is_null_or_empty(&[Constant::Null]), Ok(Constant::Bool(true)));
        assert_eq!(
            string_is_null_or_empty(&[Constant::str("x")]),
            Ok(Constant::Bool(false))
        );
        assert_eq!(
            string_equals(&[Constant::str("x"), Constant::str("x")]),
            Ok(Constant::Bool(true))
        );
        assert_eq!(string_length(&[Constant::str("héllo")]), Ok(Constant::I32(5)));
        assert!(string_length(&[Constant::Null]).is_err());
    }

    #[test]
    fn repeat() {
        assert_eq!(
            string_repeat(&[Constant::Char('a' as u16), Constant::I32(3)]),
            Ok(Constant::str("aaa"))
        );
        assert!(string_repeat(&[Constant::Char('a' as u16), Constant::I32(-1)]).is_err());
    }

    #[test]
    fn int_to_string() {
        assert_eq!(int32_to_string(&[Constant::I32(-12)]), Ok(Constant::str("-12")));
    }
}
