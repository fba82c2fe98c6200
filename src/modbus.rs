//! Modbus RTU framing: request/response encoding and CRC16, grounded in
//! `comsrv/core/protocols/modbus/{pdu,common}.rs`'s PDU builder and
//! `crc16_modbus` function, re-expressed with the `crc` crate instead of a
//! hand-rolled table (the teacher's `voltage_modbus` crate manifest lists
//! `crc = "3.0"` for exactly this).

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{Result, SilodError};

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Builds a Modbus RTU "read holding registers" request frame:
/// `[slave][0x03][address_hi][address_lo][count_hi][count_lo][crc_lo][crc_hi]`.
pub fn build_read_request(slave: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(FUNCTION_READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    let crc = CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Parses a response frame for a "read holding registers" request, returning
/// the register words. A Modbus exception response (function code with the
/// high bit set) is surfaced as a protocol error; CRC mismatch and framing
/// errors are also protocol errors since they indicate the device, not the
/// transport, produced an invalid frame.
pub fn parse_read_response(slave: u8, frame: &[u8]) -> Result<Vec<u16>> {
    if frame.len() < 5 {
        return Err(SilodError::Protocol(format!(
            "response too short: {} bytes",
            frame.len()
        )));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected_crc = CRC.checksum(body);
    let actual_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected_crc != actual_crc {
        return Err(SilodError::Protocol(format!(
            "crc mismatch: expected {expected_crc:04X}, got {actual_crc:04X}"
        )));
    }

    if body[0] != slave {
        return Err(SilodError::Protocol(format!(
            "unexpected slave id in response: expected {slave}, got {}",
            body[0]
        )));
    }

    let function_code = body[1];
    if function_code & 0x80 != 0 {
        let exception = body.get(2).copied().unwrap_or(0);
        return Err(SilodError::Protocol(format!(
            "modbus exception 0x{exception:02X} for function 0x{:02X}",
            function_code & 0x7F
        )));
    }

    if function_code != FUNCTION_READ_HOLDING_REGISTERS {
        return Err(SilodError::Protocol(format!(
            "unexpected function code: 0x{function_code:02X}"
        )));
    }

    let byte_count = body[2] as usize;
    let registers = &body[3..];
    if registers.len() != byte_count || byte_count % 2 != 0 {
        return Err(SilodError::Protocol(format!(
            "malformed register payload: byte_count={byte_count}, actual={}",
            registers.len()
        )));
    }

    Ok(registers
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_matches_known_frame() {
        let frame = build_read_request(1, 10, 1);
        assert_eq!(frame[0], 1);
        assert_eq!(frame[1], 0x03);
        assert_eq!(&frame[2..4], &[0x00, 0x0A]);
        assert_eq!(&frame[4..6], &[0x00, 0x01]);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn round_trips_a_single_register() {
        let request = build_read_request(7, 10, 1);
        assert_eq!(request.len(), 8);

        let mut response = vec![7u8, 0x03, 0x02, 0x36, 0xB0];
        let crc = CRC.checksum(&response);
        response.extend_from_slice(&crc.to_le_bytes());

        let registers = parse_read_response(7, &response).unwrap();
        assert_eq!(registers, vec![0x36B0]);
    }

    #[test]
    fn rejects_bad_crc() {
        let response = vec![7u8, 0x03, 0x02, 0x36, 0xB0, 0x00, 0x00];
        let err = parse_read_response(7, &response).unwrap_err();
        assert!(matches!(err, SilodError::Protocol(_)));
    }

    #[test]
    fn surfaces_modbus_exception() {
        let mut response = vec![7u8, 0x83, 0x02];
        let crc = CRC.checksum(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        let err = parse_read_response(7, &response).unwrap_err();
        assert!(matches!(err, SilodError::Protocol(msg) if msg.contains("exception")));
    }
}
