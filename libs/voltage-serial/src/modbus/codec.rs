//! Modbus transactions: request/response exchange, range reads with
//! graceful degradation, register writes through the RMW cache

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::cache::{RegisterCache, TentativeWrite};
use super::constants::{COIL_OFF, COIL_ON, EXCEPTION_BIT, FC_WRITE_SINGLE_COIL, WRITE_RESPONSE_PDU_SIZE};
use super::pdu::{
    function_code, is_packing, parse_read_response, parse_write_response, read_response_pdu_size,
    ModbusPdu, Operation, PduBuilder, ReadPayload,
};
use super::transport::ModbusTraits;
use crate::error::{Result, SerialError};
use crate::port::Port;
use crate::range::{RangeBuilder, RangeLimits, RangeStatus, RegisterRange};
use crate::register::{
    compose_words, extract_value, Availability, ErrorState, Register, RegisterConfig,
};

/// Timing applied to every exchange with one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    pub response_timeout: Duration,
    pub frame_timeout: Duration,
    pub request_delay: Duration,
}

/// Everything needed to talk to one slave
pub struct ModbusContext<'a> {
    pub traits: &'a dyn ModbusTraits,
    pub port: &'a mut dyn Port,
    pub slave_id: u8,
    pub timing: RequestTiming,
}

fn to_u16_address(address: u32) -> Result<u16> {
    u16::try_from(address)
        .map_err(|_| SerialError::protocol(format!("address {address} is out of modbus range")))
}

/// Send one request and return the response PDU
pub async fn process_request(
    ctx: &mut ModbusContext<'_>,
    pdu: &ModbusPdu,
    expected_pdu_size: usize,
) -> Result<Vec<u8>> {
    ctx.port
        .sleep_since_last_interaction(ctx.timing.request_delay)
        .await;
    let request = ctx.traits.finalize_request(pdu, ctx.slave_id);
    ctx.port.write_bytes(&request).await?;

    let response = ctx
        .traits
        .read_frame(
            &mut *ctx.port,
            ctx.timing.response_timeout,
            ctx.timing.frame_timeout,
            &request,
            expected_pdu_size,
        )
        .await?;
    if response.len() < 2 {
        return Err(SerialError::malformed(format!(
            "wrong PDU size: {}",
            response.len()
        )));
    }
    // exception responses carry the function code with the high bit set
    if pdu.function_code() != Some(response[0] & !EXCEPTION_BIT) {
        return Err(SerialError::unexpected(
            "request and response function code mismatch",
        ));
    }
    Ok(response)
}

/// Request, parse, and drain the line after a malformed answer
async fn exchange<T, F>(
    ctx: &mut ModbusContext<'_>,
    pdu: &ModbusPdu,
    expected_pdu_size: usize,
    parse: F,
) -> Result<T>
where
    F: FnOnce(&[u8]) -> Result<T> + Send,
{
    let result = match process_request(ctx, pdu, expected_pdu_size).await {
        Ok(response) => parse(&response),
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        if e.is_malformed() {
            if let Err(noise) = ctx.port.skip_noise().await {
                warn!("SkipNoise failed: {}", noise);
            }
        }
    }
    result
}

/// Read one range and store the values in its registers
pub async fn read_range(
    ctx: &mut ModbusContext<'_>,
    range: &RegisterRange,
    cache: &mut RegisterCache,
) -> Result<()> {
    let Some(reg_type) = range.reg_type() else {
        return Ok(());
    };
    let start = range.start();
    let count = range.count();
    let fc = function_code(reg_type, Operation::Read, false)?;
    let pdu = PduBuilder::build_read_request(fc, to_u16_address(start)?, count)?;
    let expected = read_response_pdu_size(reg_type, count);

    let payload = exchange(ctx, &pdu, expected, |response| {
        parse_read_response(response, reg_type, count)
    })
    .await?;

    match payload {
        ReadPayload::Bits(bits) => {
            for reg in range.registers() {
                let index = register_index(reg, start)?;
                let bit = bits.get(index).copied().unwrap_or_default();
                reg.set_value(u64::from(bit));
            }
        },
        ReadPayload::Words(words) => {
            for (i, word) in words.iter().enumerate() {
                cache.insert(reg_type, start + i as u32, *word);
            }
            for reg in range.registers() {
                let index = register_index(reg, start)?;
                let width = usize::from(reg.config().word16_width());
                let Some(slice) = words.get(index..index + width) else {
                    return Err(SerialError::malformed(format!(
                        "response is too short for {reg}"
                    )));
                };
                reg.set_value(extract_value(reg.config(), slice));
            }
        },
    }
    Ok(())
}

fn register_index(reg: &Register, start: u32) -> Result<usize> {
    let addr = reg.config().address.as_u32()?;
    Ok((addr - start) as usize)
}

/// Write a raw value; the cache is updated only if every request succeeds
pub async fn write_register(
    ctx: &mut ModbusContext<'_>,
    config: &RegisterConfig,
    raw: u64,
    cache: &mut RegisterCache,
) -> Result<()> {
    let reg_type = config.reg_type;
    let addr = config.address.as_u32()?;
    let width = config.word16_width();
    debug!(
        "write {} {}(s) @ {} of slave {}",
        width,
        reg_type.name(),
        addr,
        ctx.slave_id
    );

    let packing = is_packing(config);
    let fc = function_code(reg_type, Operation::Write, packing)?;
    let mut tentative = TentativeWrite::new();
    let mut requests = Vec::new();

    if fc == FC_WRITE_SINGLE_COIL {
        let value = if raw != 0 { COIL_ON } else { COIL_OFF };
        tentative.stage(reg_type, addr, value);
        requests.push(PduBuilder::build_write_single(fc, to_u16_address(addr)?, value)?);
    } else {
        let words = compose_words(config, raw, &cache.words(reg_type, addr, width));
        for (i, word) in words.iter().enumerate() {
            tentative.stage(reg_type, addr + i as u32, *word);
        }
        if packing {
            requests.push(PduBuilder::build_write_multiple_registers(
                to_u16_address(addr)?,
                &words,
            )?);
        } else {
            // least significant word first
            for (i, word) in words.iter().enumerate().rev() {
                let word_addr = to_u16_address(addr + i as u32)?;
                requests.push(PduBuilder::build_write_single(fc, word_addr, *word)?);
            }
        }
    }

    for pdu in &requests {
        exchange(ctx, pdu, WRITE_RESPONSE_PDU_SIZE, parse_write_response).await?;
    }
    tentative.commit(cache);
    Ok(())
}

fn log_read_failure(target: &dyn std::fmt::Display, error: &SerialError, quiet: bool) {
    if quiet {
        debug!("failed to read {}: {}", target, error);
    } else {
        warn!("failed to read {}: {}", target, error);
    }
}

fn mark_read_error(registers: &[Arc<Register>]) {
    for reg in registers {
        reg.set_error(ErrorState::READ_ERROR);
    }
}

fn mark_unsupported(reg: &Register) {
    debug!("register {} is not supported", reg);
    reg.set_availability(Availability::Unavailable);
    reg.set_error(ErrorState::READ_ERROR);
}

/// Read a range and recover from permanent device errors.
///
/// Returns true when the device answered, false on transport level failure.
/// `supports_holes` is cleared when the device rejects reads across holes.
pub async fn read_register_range(
    ctx: &mut ModbusContext<'_>,
    range: &mut RegisterRange,
    cache: &mut RegisterCache,
    supports_holes: &mut bool,
    quiet: bool,
) -> bool {
    if range.is_empty() {
        return true;
    }
    match read_range(ctx, range, cache).await {
        Ok(()) => {
            range.set_status(RangeStatus::Ok);
            true
        },
        Err(e) if e.is_permanent() => {
            log_read_failure(&*range, &e, quiet);
            range.set_status(RangeStatus::DeviceError);
            degrade(ctx, range, cache, supports_holes, quiet).await
        },
        Err(e) => {
            log_read_failure(&*range, &e, quiet);
            range.set_status(RangeStatus::UnknownError);
            mark_read_error(range.registers());
            false
        },
    }
}

fn single_register_range(reg: &Arc<Register>, limits: &RangeLimits, port: &dyn Port) -> RegisterRange {
    let mut range = RegisterRange::new(limits.clone());
    range.add(reg, port, None);
    range
}

/// Outcome of re-reading a set of sub-ranges
#[derive(Default)]
struct Retry {
    /// Registers of sub-ranges rejected with a permanent exception
    rejected: Vec<Arc<Register>>,
    transfer_ok: bool,
}

async fn retry_ranges(
    ctx: &mut ModbusContext<'_>,
    ranges: Vec<RegisterRange>,
    cache: &mut RegisterCache,
    quiet: bool,
) -> Retry {
    let mut retry = Retry {
        rejected: Vec::new(),
        transfer_ok: true,
    };
    for range in ranges {
        match read_range(ctx, &range, cache).await {
            Ok(()) => {},
            Err(e) if e.is_permanent() => {
                if let [reg] = range.registers() {
                    mark_unsupported(reg);
                } else {
                    retry.rejected.extend(range.registers().iter().cloned());
                }
            },
            Err(e) => {
                log_read_failure(&range, &e, quiet);
                mark_read_error(range.registers());
                retry.transfer_ok = false;
            },
        }
    }
    retry
}

async fn degrade(
    ctx: &mut ModbusContext<'_>,
    range: &RegisterRange,
    cache: &mut RegisterCache,
    supports_holes: &mut bool,
    quiet: bool,
) -> bool {
    // nothing left to narrow down
    if let [reg] = range.registers() {
        mark_unsupported(reg);
        return true;
    }

    let mut limits = range.limits().clone();
    let mut remaining: Vec<Arc<Register>> = range.registers().to_vec();
    let mut transfer_ok = true;

    // 1. unsupported registers at the borders
    let mut trimmed = false;
    if remaining.len() > 1 {
        for index in [remaining.len() - 1, 0] {
            let reg = Arc::clone(&remaining[index]);
            let border = single_register_range(&reg, &limits, &*ctx.port);
            match read_range(ctx, &border, cache).await {
                Ok(()) => {},
                Err(e) if e.is_permanent() => {
                    mark_unsupported(&reg);
                    remaining.remove(index);
                    trimmed = true;
                },
                Err(e) => {
                    log_read_failure(&reg, &e, quiet);
                    transfer_ok = false;
                },
            }
        }
    }
    let mut rejected = remaining;
    if trimmed && !rejected.is_empty() {
        let ranges = RangeBuilder::split(&rejected, &limits, &*ctx.port);
        let retry = retry_ranges(ctx, ranges, cache, quiet).await;
        transfer_ok &= retry.transfer_ok;
        rejected = retry.rejected;
    }
    if rejected.is_empty() {
        return transfer_ok;
    }

    // 2. the device does not accept holes
    if range.has_holes() {
        debug!("device rejects holes, splitting {}", range);
        *supports_holes = false;
        limits.supports_holes = false;
        let runs = RangeBuilder::split(&rejected, &limits, &*ctx.port);
        let retry = retry_ranges(ctx, runs, cache, quiet).await;
        transfer_ok &= retry.transfer_ok;
        rejected = retry.rejected;
    }

    // 3. one by one
    for reg in rejected {
        let single = single_register_range(&reg, &limits, &*ctx.port);
        match read_range(ctx, &single, cache).await {
            Ok(()) => {},
            Err(e) if e.is_permanent() => mark_unsupported(&reg),
            Err(e) => {
                log_read_failure(&reg, &e, quiet);
                reg.set_error(ErrorState::READ_ERROR);
                transfer_ok = false;
            },
        }
    }
    transfer_ok
}

/// Reject registers this codec cannot address
pub fn validate_register(config: &RegisterConfig) -> Result<()> {
    let addr = config.address.as_u32()?;
    let end = addr.checked_add(u32::from(config.word16_width()));
    if end.is_none_or(|end| end > u32::from(u16::MAX) + 1) {
        return Err(SerialError::config(format!(
            "{config} does not fit the modbus address space"
        )));
    }
    if !config.reg_type.is_single_bit() && config.word16_width() > 4 {
        return Err(SerialError::not_supported(format!(
            "{config} spans more than 64 bits"
        )));
    }
    Ok(())
}
