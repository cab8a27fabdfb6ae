//! Reply decoding and listener callbacks for Modbus TCP.

use super::frame::ModbusTcp;
use super::request::FunctionCode;
use crate::protocol::{Dispatch, Reply};
use crate::transaction::Transaction;
use bytes::Buf;
use hmi_common::{LinkError, LinkResult, TransactionFailure};

/// Exception responses set the high bit of the function code.
const EXCEPTION_FLAG: u8 = 0x80;

/// Receives decoded Modbus replies.
///
/// One object may serve many requests; every callback carries the
/// transaction id it answers. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait ModbusConfirmation: Send + Sync {
    /// Coil status bits, LSB first, `count` of them valid.
    fn on_coils(&self, transaction_id: u16, address: u16, status: &[u8], count: u16) {}

    /// Discrete input bits, LSB first, `count` of them valid.
    fn on_discrete_inputs(&self, transaction_id: u16, address: u16, status: &[u8], count: u16) {}

    /// Holding register values.
    fn on_holding_registers(&self, transaction_id: u16, address: u16, registers: &[u16]) {}

    /// Input register values.
    fn on_input_registers(&self, transaction_id: u16, address: u16, registers: &[u16]) {}

    /// Echo of a single or multiple write.
    ///
    /// `value` is the written value for single writes and the quantity
    /// written for multiple writes.
    fn on_echo_response(&self, transaction_id: u16, function_code: u8, address: u16, value: u16) {}

    /// Echo of a mask write.
    fn on_mask_echo_response(
        &self,
        transaction_id: u16,
        function_code: u8,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) {
    }

    /// The server answered with an exception.
    fn on_exception(&self, transaction_id: u16, function_code: u8, reason: u8) {}

    /// The transaction was retired without a reply.
    fn on_failure(&self, transaction_id: u16, function_code: u8, failure: TransactionFailure) {}
}

/// Decode a correlated reply and call its transaction's confirmation.
pub(crate) fn dispatch(reply: Reply<'_, ModbusTcp>) -> Dispatch {
    let Some(transaction) = reply.transaction else {
        return Dispatch::Ignored;
    };
    let Some((&wire_code, data)) = reply.body.split_first() else {
        return Dispatch::Undecodable(LinkError::Insufficient {
            needed: 1,
            available: 0,
        });
    };

    if wire_code > EXCEPTION_FLAG {
        if wire_code & !EXCEPTION_FLAG != transaction.function_code {
            return Dispatch::FunctionMismatch {
                expected: transaction.function_code,
                received: wire_code,
            };
        }
        let Some(&reason) = data.first() else {
            return Dispatch::Undecodable(LinkError::Insufficient {
                needed: 1,
                available: 0,
            });
        };
        if let Some(confirmation) = &transaction.confirmation {
            confirmation.on_exception(transaction.id, transaction.function_code, reason);
        }
        return Dispatch::Exception {
            function_code: transaction.function_code,
            reason,
        };
    }

    if wire_code != transaction.function_code {
        return Dispatch::FunctionMismatch {
            expected: transaction.function_code,
            received: wire_code,
        };
    }

    let Some(confirmation) = &transaction.confirmation else {
        return Dispatch::Ignored;
    };
    match decode_positive(transaction, data, confirmation.as_ref()) {
        Ok(unconsumed) => Dispatch::Confirmed { unconsumed },
        Err(err) => Dispatch::Undecodable(err),
    }
}

/// Decode the data of a positive reply. Returns the bytes left over.
fn decode_positive(
    transaction: &Transaction<ModbusTcp>,
    mut data: &[u8],
    confirmation: &dyn ModbusConfirmation,
) -> LinkResult<usize> {
    let id = transaction.id;
    let function_code = transaction.function_code;

    match FunctionCode::from_byte(function_code) {
        Some(code @ (FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs)) => {
            let (address, quantity) = requested_range(transaction.payload.as_slice())?;
            let status = take_counted(&mut data)?;
            // Never report more bits than the reply carries
            let carried = u16::try_from(status.len() * 8).unwrap_or(u16::MAX);
            let count = quantity.min(carried);
            if code == FunctionCode::ReadCoils {
                confirmation.on_coils(id, address, status, count);
            } else {
                confirmation.on_discrete_inputs(id, address, status, count);
            }
        }
        Some(
            code @ (FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters),
        ) => {
            let (address, _) = requested_range(transaction.payload.as_slice())?;
            let mut raw = take_counted(&mut data)?;
            let mut registers = Vec::with_capacity(raw.len() / 2);
            while raw.remaining() >= 2 {
                registers.push(raw.get_u16());
            }
            if code == FunctionCode::ReadHoldingRegisters {
                confirmation.on_holding_registers(id, address, &registers);
            } else {
                confirmation.on_input_registers(id, address, &registers);
            }
            return Ok(data.len() + raw.len());
        }
        Some(
            FunctionCode::WriteSingleCoil
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleCoils
            | FunctionCode::WriteMultipleRegisters,
        ) => {
            let address = take_u16(&mut data)?;
            let value = take_u16(&mut data)?;
            confirmation.on_echo_response(id, function_code, address, value);
        }
        Some(FunctionCode::MaskWriteRegister) => {
            let address = take_u16(&mut data)?;
            let and_mask = take_u16(&mut data)?;
            let or_mask = take_u16(&mut data)?;
            confirmation.on_mask_echo_response(id, function_code, address, and_mask, or_mask);
        }
        None => return Ok(data.len()),
    }
    Ok(data.len())
}

/// Start address and quantity of a read request payload.
fn requested_range(mut payload: &[u8]) -> LinkResult<(u16, u16)> {
    let address = take_u16(&mut payload)?;
    let quantity = take_u16(&mut payload)?;
    Ok((address, quantity))
}

fn take_u16(data: &mut &[u8]) -> LinkResult<u16> {
    if data.remaining() < 2 {
        return Err(LinkError::Insufficient {
            needed: 2,
            available: data.remaining(),
        });
    }
    Ok(data.get_u16())
}

/// Byte count prefixed data, clamped to what the frame actually holds.
fn take_counted<'a>(data: &mut &'a [u8]) -> LinkResult<&'a [u8]> {
    let Some((&byte_count, rest)) = data.split_first() else {
        return Err(LinkError::Insufficient {
            needed: 1,
            available: 0,
        });
    };
    let (counted, rest) = rest.split_at(usize::from(byte_count).min(rest.len()));
    *data = rest;
    Ok(counted)
}
