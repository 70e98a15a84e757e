#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use milli_h2::h2::{DataFrame, FrameQueue, H2Frame, H2Priority, H2Settings};
use milli_h2::{ConnectionConfig, H2Connection, H2Error, Role};

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary frame events to a connection: errors are fine, panics
    // and runaway loops are not.
    let Some((&role, rest)) = data.split_first() else {
        return;
    };
    let role = if role & 1 == 0 { Role::Server } else { Role::Client };
    let Ok(mut conn) = H2Connection::new(role, ConnectionConfig::default()) else {
        return;
    };
    let mut out = FrameQueue::with_high_water_mark(1 << 20);

    for chunk in rest.chunks_exact(6) {
        let stream_id = u32::from(chunk[1] & 0x1f);
        let arg = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
        let flag = chunk[1] & 0x80 != 0;
        let frame = match chunk[0] % 10 {
            0 => H2Frame::Data {
                stream_id,
                len: (arg & 0xffff) as usize,
                end_stream: flag,
            },
            1 => H2Frame::Headers {
                stream_id,
                end_stream: flag,
                priority: (arg & 0x8000_0000 != 0)
                    .then(|| H2Priority::new(arg & 0x1f, (arg >> 8) as u16 & 0x1ff, flag)),
            },
            2 => H2Frame::Priority {
                stream_id,
                priority: H2Priority::new(arg & 0x1f, (arg >> 8) as u16 & 0x1ff, flag),
            },
            3 => H2Frame::RstStream {
                stream_id,
                code: H2Error::from_code(arg & 0xf),
            },
            4 => {
                let params = [(chunk[2] as u16 % 7, arg & 0x7fff_ffff)];
                let Ok(settings) = H2Settings::from_params(&params) else {
                    continue;
                };
                H2Frame::Settings(settings)
            }
            5 => H2Frame::PushPromise {
                stream_id,
                promised_id: arg & 0x3f,
            },
            6 => H2Frame::GoAway {
                last_stream_id: arg & 0x3f,
                code: H2Error::from_code(arg >> 28),
                debug: &chunk[2..],
            },
            7 => H2Frame::WindowUpdate {
                stream_id,
                increment: arg,
            },
            8 => {
                let body = Bytes::from(vec![0u8; (arg & 0x3fff) as usize]);
                let _ = conn.add_flow_controlled(stream_id, Box::new(DataFrame::new(stream_id, body, flag)));
                continue;
            }
            _ => {
                let _ = conn.write_pending_bytes(&mut out);
                while out.poll_frame().is_some() {}
                continue;
            }
        };
        if let Err(e) = conn.on_frame(frame) {
            let _ = conn.handle_error(&e, &mut out);
        }
        if conn.is_close_complete() {
            break;
        }
    }
    let _ = conn.write_pending_bytes(&mut out);
});
