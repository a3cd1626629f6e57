//! Protocol session operations.
//!
//! Free functions that drive one request/response exchange (or a fixed pair
//! of them) over a [`Connection`]. Each function writes the request, reads
//! the typed response payload, then the trailing status header. None of them
//! retry: retry policy belongs to the caller.

use std::io::{Read, Write};

use tracing::debug;

use crate::codec;
use crate::conn::{ConnError, Connection};
use crate::error::WireError;
use crate::opcode::Opcode;
use crate::protocol::Request;
use crate::protocol::clrfreq::{AssignedFrequency, ClearFreqParameters};
use crate::protocol::data::{BadWindow, RawSequenceData, TxStatus};
use crate::protocol::params::{ControlParameters, DataParameters};
use crate::protocol::scan::ScanStart;
use crate::protocol::sequence::SequenceRegistration;
use crate::protocol::settings::IniQuery;

/// Upper bound on samples per channel accepted from `GET_DATA`.
pub const MAX_SAMPLES: u32 = 1 << 20;
/// Upper bound on bad-transmission windows per sequence.
pub const MAX_BAD_WINDOWS: u32 = 1 << 16;
/// Upper bound on reported transmitters.
pub const MAX_TRANSMITTERS: i32 = 1024;
/// Upper bound on an ini setting value length.
const MAX_SETTING_LEN: i32 = 1 << 16;

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Claim `(radar, channel)` on the controller.
///
/// A negative status means the channel is unavailable and comes back as
/// [`ConnError::Rejected`].
pub fn set_channel<S: Read + Write>(
    conn: &mut Connection<S>,
    radar: i32,
    channel: i32,
) -> Result<(), ConnError> {
    conn.send(&Request::SetRadarChan { radar, channel })?;
    let status = conn.recv_status(Opcode::SetRadarChan)?;
    if status < 0 {
        return Err(ConnError::Rejected { opcode: Opcode::SetRadarChan, status });
    }
    Ok(())
}

/// Query a boolean ini setting.
///
/// Returns `None` when the controller does not know the setting or reports
/// it with a different type.
pub fn query_bool_setting<S: Read + Write>(
    conn: &mut Connection<S>,
    name: &str,
) -> Result<Option<i32>, ConnError> {
    let query = IniQuery::boolean(name);
    conn.send(&Request::QueryIniSettings(query.clone()))?;
    let returned_type = conn.recv_u8()?;
    let data_length = conn.recv_i32()?;
    if !(0..=MAX_SETTING_LEN).contains(&data_length) {
        return Err(WireError::invalid_length("IniSetting", data_length).into());
    }
    let value = if returned_type == query.entry_type {
        Some(conn.recv_i32()?)
    } else {
        None
    };
    let status = conn.recv_status(Opcode::QueryIniSettings)?;
    debug!(name, returned_type = %char::from(returned_type), ?value, status, "ini setting");
    Ok(value.filter(|v| status != 0 && *v >= 0))
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

pub fn get_parameters<S: Read + Write>(
    conn: &mut Connection<S>,
) -> Result<ControlParameters, ConnError> {
    conn.send(&Request::GetParameters)?;
    let payload = conn.recv_exact(ControlParameters::LEN)?;
    let params = ControlParameters::decode(&payload).map_err(|e| e.with_raw(&payload))?;
    conn.recv_status(Opcode::GetParameters)?;
    Ok(params)
}

pub fn set_parameters<S: Read + Write>(
    conn: &mut Connection<S>,
    params: &ControlParameters,
) -> Result<(), ConnError> {
    conn.send(&Request::SetParameters(params.clone()))?;
    conn.recv_status(Opcode::SetParameters)?;
    Ok(())
}

/// Register a pulse sequence. Returns the sequence index on acceptance.
///
/// Any status other than 1 is a rejection; the caller decides whether that
/// ends the scan attempt.
pub fn register_sequence<S: Read + Write>(
    conn: &mut Connection<S>,
    reg: &SequenceRegistration,
) -> Result<i32, ConnError> {
    conn.send(&Request::RegisterSeq(Box::new(reg.clone())))?;
    let status = conn.recv_status(Opcode::RegisterSeq)?;
    if status != 1 {
        return Err(ConnError::Rejected { opcode: Opcode::RegisterSeq, status });
    }
    Ok(reg.params.index)
}

// ---------------------------------------------------------------------------
// Clear frequency search
// ---------------------------------------------------------------------------

/// First half of a clear-frequency search. Must be followed directly by
/// [`request_assigned_frequency`]; prefer [`clear_frequency_search`].
pub fn request_clear_freq_search<S: Read + Write>(
    conn: &mut Connection<S>,
    params: &ClearFreqParameters,
) -> Result<(), ConnError> {
    conn.send(&Request::RequestClearFreqSearch(params.clone()))?;
    conn.recv_status(Opcode::RequestClearFreqSearch)?;
    Ok(())
}

pub fn request_assigned_frequency<S: Read + Write>(
    conn: &mut Connection<S>,
) -> Result<AssignedFrequency, ConnError> {
    conn.send(&Request::RequestAssignedFreq)?;
    let payload = conn.recv_exact(AssignedFrequency::LEN)?;
    let assigned = AssignedFrequency::decode(&payload).map_err(|e| e.with_raw(&payload))?;
    conn.recv_status(Opcode::RequestAssignedFreq)?;
    Ok(assigned)
}

/// Both halves of a clear-frequency search with nothing in between.
pub fn clear_frequency_search<S: Read + Write>(
    conn: &mut Connection<S>,
    params: &ClearFreqParameters,
) -> Result<AssignedFrequency, ConnError> {
    request_clear_freq_search(conn, params)?;
    request_assigned_frequency(conn)
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Arm the controller for one pulse sequence.
pub fn set_ready<S: Read + Write>(conn: &mut Connection<S>) -> Result<(), ConnError> {
    conn.send(&Request::SetReadyFlag)?;
    conn.recv_status(Opcode::SetReadyFlag)?;
    Ok(())
}

/// Result of [`get_data`].
#[derive(Debug, Clone)]
pub struct DataReply {
    pub event: DataParameters,
    /// Parameter block the controller actually used for the sequence.
    pub params: ControlParameters,
    /// `None` when the controller had no samples for this sequence.
    pub data: Option<RawSequenceData>,
}

/// Collect the samples of the last triggered sequence, then read back the
/// controller's parameter block.
pub fn get_data<S: Read + Write>(conn: &mut Connection<S>) -> Result<DataReply, ConnError> {
    conn.send(&Request::GetData)?;
    let payload = conn.recv_exact(DataParameters::LEN)?;
    let event = DataParameters::decode(&payload).map_err(|e| e.with_raw(&payload))?;

    let data = if event.has_samples() {
        Some(recv_sequence_data(conn, event.samples)?)
    } else {
        None
    };
    conn.recv_status(Opcode::GetData)?;

    let params = get_parameters(conn)?;
    Ok(DataReply { event, params, data })
}

fn recv_sequence_data<S: Read + Write>(
    conn: &mut Connection<S>,
    samples: u32,
) -> Result<RawSequenceData, ConnError> {
    if samples > MAX_SAMPLES {
        return Err(WireError::invalid_length("DataSamples", samples).into());
    }
    let n = samples as usize;
    let main = codec::read_u32_array(&conn.recv_exact(n * 4)?, 0, n)?;
    let back = codec::read_u32_array(&conn.recv_exact(n * 4)?, 0, n)?;

    let count = conn.recv_u32()?;
    if count > MAX_BAD_WINDOWS {
        return Err(WireError::invalid_length("BadTransmissions", count).into());
    }
    let count = count as usize;
    let starts = codec::read_u32_array(&conn.recv_exact(count * 4)?, 0, count)?;
    let durations = codec::read_u32_array(&conn.recv_exact(count * 4)?, 0, count)?;
    let bad_windows = starts
        .into_iter()
        .zip(durations)
        .map(|(start_usec, duration_usec)| BadWindow { start_usec, duration_usec })
        .collect();

    let ntx = conn.recv_i32()?;
    if !(0..=MAX_TRANSMITTERS).contains(&ntx) {
        return Err(WireError::invalid_length("Transmitters", ntx).into());
    }
    let ntx = ntx as usize;
    let agc = codec::read_i32_array(&conn.recv_exact(ntx * 4)?, 0, ntx)?;
    let low_power = codec::read_i32_array(&conn.recv_exact(ntx * 4)?, 0, ntx)?;

    Ok(RawSequenceData {
        main,
        back,
        bad_windows,
        tx_status: TxStatus { agc, low_power },
    })
}

// ---------------------------------------------------------------------------
// Liveness and scan signalling
// ---------------------------------------------------------------------------

pub fn ping<S: Read + Write>(conn: &mut Connection<S>) -> Result<(), ConnError> {
    conn.send(&Request::Ping)?;
    conn.recv_status(Opcode::Ping)?;
    Ok(())
}

/// Announce a scan. A negative status means the channel is busy and comes
/// back as [`ConnError::Rejected`].
pub fn set_active<S: Read + Write>(
    conn: &mut Connection<S>,
    plan: &ScanStart,
) -> Result<(), ConnError> {
    conn.send(&Request::SetActive(plan.clone()))?;
    let status = conn.recv_status(Opcode::SetActive)?;
    if status < 0 {
        return Err(ConnError::Rejected { opcode: Opcode::SetActive, status });
    }
    Ok(())
}

pub fn set_inactive<S: Read + Write>(conn: &mut Connection<S>) -> Result<(), ConnError> {
    conn.send(&Request::SetInactive)?;
    conn.recv_status(Opcode::SetInactive)?;
    Ok(())
}

/// Tell the controller this client is leaving and wait for the ack.
pub fn quit<S: Read + Write>(conn: &mut Connection<S>) -> Result<(), ConnError> {
    conn.send(&Request::Quit)?;
    conn.recv_status(Opcode::Quit)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::settings::IFMODE_SETTING;
    use crate::testutil::Script;

    #[test]
    fn channel_unavailable() {
        let mut conn = Connection::from_stream(Script::new().status(Opcode::SetRadarChan, -1).stream());
        assert!(matches!(
            set_channel(&mut conn, 1, 2),
            Err(ConnError::Rejected { opcode: Opcode::SetRadarChan, status: -1 })
        ));
    }

    #[test]
    fn ifmode_query_reads_value_when_type_matches() {
        let script = Script::new()
            .u8(b'b')
            .i32(4)
            .i32(1)
            .status(Opcode::QueryIniSettings, 1);
        let mut conn = Connection::from_stream(script.stream());
        assert_eq!(query_bool_setting(&mut conn, IFMODE_SETTING).unwrap(), Some(1));
        assert_eq!(conn.get_ref().remaining(), 0);
    }

    #[test]
    fn ifmode_query_skips_value_on_type_mismatch() {
        let script = Script::new().u8(b'i').i32(4).status(Opcode::QueryIniSettings, 1);
        let mut conn = Connection::from_stream(script.stream());
        assert_eq!(query_bool_setting(&mut conn, IFMODE_SETTING).unwrap(), None);
    }

    #[test]
    fn ifmode_ignored_with_zero_status() {
        let script = Script::new()
            .u8(b'b')
            .i32(4)
            .i32(1)
            .status(Opcode::QueryIniSettings, 0);
        let mut conn = Connection::from_stream(script.stream());
        assert_eq!(query_bool_setting(&mut conn, IFMODE_SETTING).unwrap(), None);
    }

    #[test]
    fn get_parameters_reads_block_then_status() {
        let p = ControlParameters { beam: 4, tfreq: 12000, ..Default::default() };
        let mut conn = Connection::from_stream(Script::new().params(&p).stream());
        assert_eq!(get_parameters(&mut conn).unwrap(), p);
        assert_eq!(conn.get_ref().written(), &[b'c', 0, 0, 0, 0]);
    }

    #[test]
    fn register_rejected_unless_status_one() {
        let reg = SequenceRegistration {
            params: Default::default(),
            rep: vec![],
            code: vec![],
            pattern: vec![],
            phase_code: vec![1],
        };
        let mut conn = Connection::from_stream(Script::new().status(Opcode::RegisterSeq, 0).stream());
        assert!(matches!(
            register_sequence(&mut conn, &reg),
            Err(ConnError::Rejected { status: 0, .. })
        ));

        let mut conn = Connection::from_stream(Script::new().status(Opcode::RegisterSeq, 1).stream());
        assert_eq!(register_sequence(&mut conn, &reg).unwrap(), 0);
    }

    #[test]
    fn clear_frequency_search_is_two_back_to_back_exchanges() {
        let script = Script::new()
            .status(Opcode::RequestClearFreqSearch, 0)
            .i32(10550)
            .f32(2.5)
            .status(Opcode::RequestAssignedFreq, 0);
        let mut conn = Connection::from_stream(script.stream());
        let assigned = clear_frequency_search(&mut conn, &ClearFreqParameters::band(10400, 10700)).unwrap();
        assert_eq!(assigned, AssignedFrequency { tfreq: 10550, noise: 2.5 });

        let written = conn.get_ref().written();
        assert_eq!(written[0], b'<');
        assert_eq!(written[5 + ClearFreqParameters::LEN], b'>');
        assert_eq!(written.len(), 5 + ClearFreqParameters::LEN + 5);
    }

    #[test]
    fn get_data_with_samples() {
        let script = Script::new().data(&[1, 2, 3], &[4, 5, 6], 7);
        let mut conn = Connection::from_stream(script.stream());
        let reply = get_data(&mut conn).unwrap();
        let data = reply.data.unwrap();
        assert_eq!(data.main, vec![1, 2, 3]);
        assert_eq!(data.back, vec![4, 5, 6]);
        assert_eq!(reply.params.beam, 7);
        assert_eq!(conn.get_ref().remaining(), 0);
    }

    #[test]
    fn get_data_bad_windows_and_transmitters() {
        let dprm = DataParameters { event_secs: 1, event_nsecs: 2, samples: 1, status: 0 };
        let mut script = Script::new();
        for b in dprm.encode() {
            script = script.u8(b);
        }
        let script = script
            .u32(9)
            .u32(8)
            .u32(2)
            .u32(100)
            .u32(300)
            .u32(10)
            .u32(20)
            .i32(1)
            .i32(1)
            .i32(0)
            .status(Opcode::GetData, 0)
            .params(&ControlParameters::default());
        let mut conn = Connection::from_stream(script.stream());
        let data = get_data(&mut conn).unwrap().data.unwrap();
        assert_eq!(
            data.bad_windows,
            vec![
                BadWindow { start_usec: 100, duration_usec: 10 },
                BadWindow { start_usec: 300, duration_usec: 20 },
            ]
        );
        assert_eq!(data.tx_status.agc, vec![1]);
        assert_eq!(data.tx_status.low_power, vec![0]);
    }

    #[test]
    fn get_data_without_samples() {
        let dprm = DataParameters { status: 1, ..Default::default() };
        let mut script = Script::new();
        for b in dprm.encode() {
            script = script.u8(b);
        }
        let script = script.status(Opcode::GetData, 0).params(&ControlParameters::default());
        let mut conn = Connection::from_stream(script.stream());
        assert!(get_data(&mut conn).unwrap().data.is_none());
    }

    #[test]
    fn get_data_rejects_absurd_sample_count() {
        let dprm = DataParameters { samples: MAX_SAMPLES + 1, ..Default::default() };
        let mut script = Script::new();
        for b in dprm.encode() {
            script = script.u8(b);
        }
        let mut conn = Connection::from_stream(script.stream());
        assert!(matches!(
            get_data(&mut conn),
            Err(ConnError::Wire(WireError::InvalidLength { .. }))
        ));
    }

    #[test]
    fn set_active_busy() {
        let mut conn = Connection::from_stream(Script::new().status(Opcode::SetActive, -3).stream());
        assert!(matches!(
            set_active(&mut conn, &ScanStart::default()),
            Err(ConnError::Rejected { opcode: Opcode::SetActive, status: -3 })
        ));
    }

    #[test]
    fn truncated_response_is_disconnect() {
        let mut conn = Connection::from_stream(Script::new().i32(10550).stream());
        assert!(matches!(request_assigned_frequency(&mut conn), Err(ConnError::Disconnected)));
    }
}
