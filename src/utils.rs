use std::{io::Write, sync::Once};

use env_logger::Builder;

static INIT: Once = Once::new();

pub fn init_log() {
    INIT.call_once(|| {
        let mut builder = Builder::from_default_env();
        builder
            .format_timestamp_secs()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap(),
                    record.line().unwrap(),
                    record.args()
                )
            })
            .init();
    });
}

/// Hex depiction of the first `len` bytes of a page, for debug logs.
pub fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let end = std::cmp::min(len, bytes.len());
    hex::encode(&bytes[..end])
}
