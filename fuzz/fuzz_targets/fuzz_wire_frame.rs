#![no_main]

use libfuzzer_sys::fuzz_target;

use grafdoor::wire::envelope::read_request_header;
use grafdoor::wire::frame::{read_rid, read_string};

fuzz_target!(|data: &[u8]| {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut cursor = std::io::Cursor::new(data);
        if read_request_header(&mut cursor).await.is_err() {
            return;
        }
        let _ = read_rid(&mut cursor).await;
        let _ = read_string(&mut cursor).await;
    });
});
