#![no_main]

use libfuzzer_sys::fuzz_target;
use socks4d::socks4::{RawHeader, Request};

fuzz_target!(|data: &[u8]| {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut cursor = std::io::Cursor::new(data);
        let header = match RawHeader::read_from(&mut cursor).await {
            Ok(header) => header,
            Err(_) => return,
        };
        let command = match header.validate() {
            Ok(command) => command,
            Err(_) => return,
        };
        let _ = Request::read_trailers(&mut cursor, command, &header).await;
    });
});
