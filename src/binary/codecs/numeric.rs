//! `decimal` and `bigint` wire format.
//!
//! ```text
//! u16 ndigits
//! i16 weight
//! u16 sign      0x0000 positive, 0x4000 negative
//! u16 dscale    always 0 for bigint
//! u16 digits[ndigits]   base 10000
//! ```

use bytes::{BufMut, BytesMut};

use crate::binary::buffer::BufferContract;
use crate::binary::types::Decimal;
use crate::error::{EdgeError, Result};

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;

pub fn decode(buf: &mut BufferContract<'_>, integer: bool) -> Result<Decimal> {
    let ndigits = buf.read_u16()? as usize;
    let weight = buf.read_i16()?;
    let negative = match buf.read_u16()? {
        SIGN_POSITIVE => false,
        SIGN_NEGATIVE => true,
        other => return Err(EdgeError::protocol(format!("invalid numeric sign 0x{:04x}", other))),
    };
    let scale = buf.read_u16()?;
    if integer && scale != 0 {
        return Err(EdgeError::protocol(format!("bigint with non-zero scale {}", scale)));
    }
    let mut digits = Vec::with_capacity(ndigits);
    for _ in 0..ndigits {
        let digit = buf.read_u16()?;
        if digit >= 10_000 {
            return Err(EdgeError::protocol(format!("numeric digit {} out of range", digit)));
        }
        digits.push(digit);
    }
    Ok(Decimal {
        negative,
        weight,
        scale,
        digits,
    })
}

pub fn encode(buf: &mut BytesMut, value: &Decimal, integer: bool) -> Result<()> {
    if integer && value.scale != 0 {
        return Err(EdgeError::invalid_value(format!(
            "bigint cannot carry a fractional part ({})",
            value
        )));
    }
    let ndigits = u16::try_from(value.digits.len())
        .map_err(|_| EdgeError::invalid_value("numeric has too many digit groups"))?;
    buf.put_u16(ndigits);
    buf.put_i16(value.weight);
    buf.put_u16(if value.negative { SIGN_NEGATIVE } else { SIGN_POSITIVE });
    buf.put_u16(value.scale);
    for digit in &value.digits {
        buf.put_u16(*digit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_wire_layout() {
        let d: Decimal = "-12.5".parse().unwrap();
        let mut buf = BytesMut::new();
        encode(&mut buf, &d, false).unwrap();
        // ndigits=2 weight=0 sign=neg dscale=1 digits=[12, 5000]
        assert_eq!(
            &buf[..],
            &[0, 2, 0, 0, 0x40, 0, 0, 1, 0, 12, 0x13, 0x88]
        );
        let back = decode(&mut BufferContract::new(&buf), false).unwrap();
        assert_eq!(back.to_string(), "-12.5");
    }

    #[test]
    fn test_bigint_rejects_scale() {
        let d: Decimal = "1.5".parse().unwrap();
        assert!(encode(&mut BytesMut::new(), &d, true).is_err());
    }

    #[test]
    fn test_invalid_sign() {
        let data = [0, 0, 0, 0, 0x12, 0x34, 0, 0];
        assert!(decode(&mut BufferContract::new(&data), false).is_err());
    }
}
