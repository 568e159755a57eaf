//! FLAC subframe decoding: CONSTANT, VERBATIM, FIXED and LPC predictors
//! with Rice-coded residuals.

use crate::error::{Error, Recovery, Result};

use super::frame::BitReader;

/// Highest fixed-predictor order the format defines.
const MAX_FIXED_ORDER: u32 = 4;

/// Decodes one subframe into `out`, which must be `block_size` long.
///
/// `bits_per_sample` is the channel's coded depth, already adjusted for
/// side channels. Wasted bits are consumed here and shifted back in before
/// returning, so `out` holds samples at the coded depth.
///
/// # Errors
///
/// Format errors on reserved type codes, impossible predictor parameters
/// or a truncated bitstream.
pub fn decode_subframe(
    reader: &mut BitReader<'_>,
    block_size: usize,
    bits_per_sample: u32,
    out: &mut [i32],
) -> Result<()> {
    debug_assert!(out.len() >= block_size);

    if reader.read_bits(1)? != 0 {
        return Err(Error::format("subframe padding bit is set").with_recovery(Recovery::SkipSection));
    }
    let type_code = reader.read_bits(6)?;

    let wasted = if reader.read_bits(1)? == 1 {
        reader.read_unary()? + 1
    } else {
        0
    };
    if wasted >= bits_per_sample {
        return Err(
            Error::format("wasted bits exceed sample depth").with_recovery(Recovery::SkipSection)
        );
    }
    let depth = bits_per_sample - wasted;
    if depth > 32 {
        // A 32-bit side channel would need 33-bit residual samples.
        return Err(
            Error::format("sample depth beyond 32 bits is unsupported")
                .with_recovery(Recovery::SkipSection),
        );
    }

    match type_code {
        0b00_0000 => decode_constant(reader, block_size, depth, out)?,
        0b00_0001 => decode_verbatim(reader, block_size, depth, out)?,
        0b00_1000..=0b00_1100 => {
            decode_fixed(reader, block_size, depth, type_code & 0x07, out)?;
        }
        0b10_0000..=0b11_1111 => {
            decode_lpc(reader, block_size, depth, (type_code & 0x1F) + 1, out)?;
        }
        _ => {
            return Err(Error::format(format!("reserved subframe type {type_code:#08b}"))
                .with_recovery(Recovery::SkipSection))
        }
    }

    if wasted > 0 {
        for sample in &mut out[..block_size] {
            *sample <<= wasted;
        }
    }
    Ok(())
}

fn decode_constant(
    reader: &mut BitReader<'_>,
    block_size: usize,
    depth: u32,
    out: &mut [i32],
) -> Result<()> {
    let value = reader.read_signed(depth)?;
    out[..block_size].fill(value);
    Ok(())
}

fn decode_verbatim(
    reader: &mut BitReader<'_>,
    block_size: usize,
    depth: u32,
    out: &mut [i32],
) -> Result<()> {
    for sample in &mut out[..block_size] {
        *sample = reader.read_signed(depth)?;
    }
    Ok(())
}

fn decode_fixed(
    reader: &mut BitReader<'_>,
    block_size: usize,
    depth: u32,
    order: u32,
    out: &mut [i32],
) -> Result<()> {
    if order > MAX_FIXED_ORDER {
        return Err(Error::format(format!("fixed predictor order {order} is reserved"))
            .with_recovery(Recovery::SkipSection));
    }
    let order = order as usize;
    if order > block_size {
        return Err(
            Error::format("predictor order exceeds block size").with_recovery(Recovery::SkipSection)
        );
    }

    for sample in &mut out[..order] {
        *sample = reader.read_signed(depth)?;
    }
    decode_residual(reader, block_size, order, out)?;

    // The fixed predictors are the first differences up to order four;
    // restoration is the running re-integration.
    for i in order..block_size {
        let prediction: i64 = match order {
            0 => 0,
            1 => i64::from(out[i - 1]),
            2 => 2 * i64::from(out[i - 1]) - i64::from(out[i - 2]),
            3 => {
                3 * i64::from(out[i - 1]) - 3 * i64::from(out[i - 2]) + i64::from(out[i - 3])
            }
            _ => {
                4 * i64::from(out[i - 1]) - 6 * i64::from(out[i - 2])
                    + 4 * i64::from(out[i - 3])
                    - i64::from(out[i - 4])
            }
        };
        out[i] = (i64::from(out[i]) + prediction) as i32;
    }
    Ok(())
}

fn decode_lpc(
    reader: &mut BitReader<'_>,
    block_size: usize,
    depth: u32,
    order: u32,
    out: &mut [i32],
) -> Result<()> {
    let order = order as usize;
    if order > block_size {
        return Err(
            Error::format("predictor order exceeds block size").with_recovery(Recovery::SkipSection)
        );
    }

    for sample in &mut out[..order] {
        *sample = reader.read_signed(depth)?;
    }

    let precision_code = reader.read_bits(4)?;
    if precision_code == 0b1111 {
        return Err(
            Error::format("invalid coefficient precision code").with_recovery(Recovery::SkipSection)
        );
    }
    let precision = precision_code + 1;

    let shift = reader.read_signed(5)?;
    if shift < 0 {
        return Err(
            Error::format("negative prediction shift").with_recovery(Recovery::SkipSection)
        );
    }

    let mut coefficients = [0i64; 32];
    for coefficient in coefficients.iter_mut().take(order) {
        *coefficient = i64::from(reader.read_signed(precision)?);
    }

    decode_residual(reader, block_size, order, out)?;

    for i in order..block_size {
        let mut prediction: i64 = 0;
        for (j, &coefficient) in coefficients.iter().take(order).enumerate() {
            prediction += coefficient * i64::from(out[i - 1 - j]);
        }
        out[i] = (i64::from(out[i]) + (prediction >> shift)) as i32;
    }
    Ok(())
}

/// Decodes the Rice-coded residual section into `out[order..block_size]`.
fn decode_residual(
    reader: &mut BitReader<'_>,
    block_size: usize,
    order: usize,
    out: &mut [i32],
) -> Result<()> {
    let method = reader.read_bits(2)?;
    let (param_bits, escape) = match method {
        0b00 => (4u32, 0b1111),
        0b01 => (5u32, 0b1_1111),
        _ => {
            return Err(Error::format(format!("reserved residual coding method {method}"))
                .with_recovery(Recovery::SkipSection))
        }
    };

    let partition_order = reader.read_bits(4)?;
    let partitions = 1usize << partition_order;
    if block_size % partitions != 0 {
        return Err(Error::format("partition count does not divide block size")
            .with_recovery(Recovery::SkipSection));
    }
    let partition_len = block_size >> partition_order;
    if (partitions == 1 && partition_len <= order) || (partitions > 1 && partition_len < order) {
        return Err(Error::format("first partition shorter than predictor order")
            .with_recovery(Recovery::SkipSection));
    }

    let mut index = order;
    for partition in 0..partitions {
        let count = if partition == 0 {
            partition_len - order
        } else {
            partition_len
        };

        let parameter = reader.read_bits(param_bits)?;
        if parameter == escape {
            // Escape: the partition is stored raw at an explicit width.
            let raw_bits = reader.read_bits(5)?;
            for sample in &mut out[index..index + count] {
                *sample = if raw_bits == 0 { 0 } else { reader.read_signed(raw_bits)? };
            }
        } else {
            for sample in &mut out[index..index + count] {
                let quotient = u64::from(reader.read_unary()?);
                let remainder = u64::from(reader.read_bits(parameter)?);
                let folded = (quotient << parameter) | remainder;
                *sample = ((folded >> 1) as i64 ^ -((folded & 1) as i64)) as i32;
            }
        }
        index += count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flac::frame::testing::BitWriter;

    fn decode(bits: &[u8], block_size: usize, depth: u32) -> Result<Vec<i32>> {
        let mut reader = BitReader::new(bits);
        let mut out = vec![0i32; block_size];
        decode_subframe(&mut reader, block_size, depth, &mut out)?;
        Ok(out)
    }

    #[test]
    fn constant_subframe() {
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1); // padding
        writer.push_bits(0b00_0000, 6); // constant
        writer.push_bits(0, 1); // no wasted bits
        writer.push_bits(0xFF9C_u64 & 0xFFFF, 16); // -100
        let out = decode(&writer.finish(), 8, 16).expect("decode");
        assert_eq!(out, vec![-100; 8]);
    }

    #[test]
    fn verbatim_subframe() {
        let samples: [i32; 4] = [1, -2, 300, -400];
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_0001, 6);
        writer.push_bits(0, 1);
        for &s in &samples {
            writer.push_bits(u64::from(s as u32 & 0xFFFF), 16);
        }
        let out = decode(&writer.finish(), 4, 16).expect("decode");
        assert_eq!(out, samples);
    }

    #[test]
    fn fixed_order_one_with_rice_residual() {
        // Samples 10, 12, 15: warmup 10, then residuals 2 and 3 against
        // the order-1 predictor.
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_1001, 6); // fixed, order 1
        writer.push_bits(0, 1);
        writer.push_bits(10, 16); // warmup
        writer.push_bits(0b00, 2); // 4-bit rice parameters
        writer.push_bits(0, 4); // partition order 0
        writer.push_bits(2, 4); // rice parameter 2
        writer.push_rice(2, 2);
        writer.push_rice(3, 2);

        let out = decode(&writer.finish(), 3, 16).expect("decode");
        assert_eq!(out, vec![10, 12, 15]);
    }

    #[test]
    fn fixed_order_two_restores_line() {
        // A perfect ramp has zero residuals under the order-2 predictor.
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_1010, 6); // fixed, order 2
        writer.push_bits(0, 1);
        writer.push_bits(100, 16);
        writer.push_bits(110, 16);
        writer.push_bits(0b00, 2);
        writer.push_bits(0, 4);
        writer.push_bits(0, 4); // rice parameter 0
        for _ in 0..6 {
            writer.push_rice(0, 0);
        }
        let out = decode(&writer.finish(), 8, 16).expect("decode");
        assert_eq!(out, vec![100, 110, 120, 130, 140, 150, 160, 170]);
    }

    #[test]
    fn escaped_partition_reads_raw_values() {
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_1000, 6); // fixed, order 0
        writer.push_bits(0, 1);
        writer.push_bits(0b00, 2);
        writer.push_bits(0, 4);
        writer.push_bits(0b1111, 4); // escape
        writer.push_bits(6, 5); // 6 raw bits per sample
        for &v in &[-5i32, 7, 0, -1] {
            writer.push_bits(u64::from(v as u32 & 0x3F), 6);
        }
        let out = decode(&writer.finish(), 4, 16).expect("decode");
        assert_eq!(out, vec![-5, 7, 0, -1]);
    }

    #[test]
    fn wasted_bits_shift_back_in() {
        // Constant -4 at depth 14 with 2 wasted bits yields -16 at 16.
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_0000, 6);
        writer.push_bits(1, 1); // wasted bits follow
        writer.push_unary(1); // wasted = 2
        writer.push_bits(u64::from((-4i32 as u32) & 0x3FFF), 14);
        let out = decode(&writer.finish(), 4, 16).expect("decode");
        assert_eq!(out, vec![-16; 4]);
    }

    #[test]
    fn reserved_type_codes_are_rejected() {
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_0010, 6); // reserved
        writer.push_bits(0, 1);
        let err = decode(&writer.finish(), 4, 16).unwrap_err();
        assert_eq!(err.recovery, Recovery::SkipSection);
    }

    #[test]
    fn truncated_bitstream_is_an_error() {
        let mut writer = BitWriter::new();
        writer.push_bits(0, 1);
        writer.push_bits(0b00_0001, 6); // verbatim, but no samples follow
        writer.push_bits(0, 1);
        assert!(decode(&writer.finish(), 16, 16).is_err());
    }
}
