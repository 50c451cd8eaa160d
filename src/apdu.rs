//! APDU transceive, including the T=0 `61 xx` GET RESPONSE convention.
//!
//! A T=0 card signals "more data is waiting" by returning status bytes
//! `61 xx`; the host is expected to immediately issue `00 C0 00 00 xx`
//! (GET RESPONSE) and append whatever comes back, repeating until a
//! final status other than `61 xx` arrives. `6C xx` means "resend with
//! Le set to xx" instead. Neither applies under T=1, which already
//! frames multi-part responses itself.

use crate::connection::Connection;
use crate::error::HostError;
use crate::resource_manager::{Protocol, ResourceManager};

/// Matches the reference engine's fixed receive-buffer size for every
/// transmit, single or chained.
const RESPONSE_BUFFER_LEN: usize = 32_767;

const SW1_MORE_DATA: u8 = 0x61;
const GET_RESPONSE: [u8; 4] = [0x00, 0xc0, 0x00, 0x00];

/// Send `command` over `conn` and return the fully assembled response,
/// including its trailing status word. Chases `61 xx` continuations when
/// the negotiated protocol is T=0; passes T=1 exchanges through
/// untouched.
pub fn transceive(
    conn: &Connection,
    rm: &mut dyn ResourceManager,
    command: &[u8],
) -> Result<Vec<u8>, HostError> {
    if conn.protocol() != Some(Protocol::T0) {
        return transmit_once(conn, rm, command);
    }

    let mut assembled = Vec::new();
    let mut next_command = command.to_vec();

    loop {
        let response = transmit_once(conn, rm, &next_command)?;
        if response.len() < 2 {
            assembled.extend_from_slice(&response);
            break;
        }
        let (data, sw) = response.split_at(response.len() - 2);
        let (sw1, sw2) = (sw[0], sw[1]);

        if sw1 == SW1_MORE_DATA {
            assembled.extend_from_slice(data);
            next_command = get_response_command(sw2);
            continue;
        }

        assembled.extend_from_slice(data);
        assembled.extend_from_slice(&[sw1, sw2]);
        break;
    }

    Ok(assembled)
}

fn get_response_command(available: u8) -> Vec<u8> {
    let mut cmd = GET_RESPONSE.to_vec();
    cmd.push(available);
    cmd
}

/// Each re-transmit gets a fresh full-size buffer: the resource manager
/// treats the passed-in length as the receive capacity, and reusing a
/// truncated buffer from a previous hop would make it think the buffer
/// shrank.
fn transmit_once(
    conn: &Connection,
    rm: &mut dyn ResourceManager,
    command: &[u8],
) -> Result<Vec<u8>, HostError> {
    let mut buf = vec![0u8; RESPONSE_BUFFER_LEN];
    let len = conn.transmit(rm, command, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}
