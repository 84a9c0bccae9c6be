//! JSON encoding for plaintext that must not outlive its request.
//!
//! `serde_json::to_vec` grows its buffer by reallocation, which hands the
//! previous block back to the allocator with the secret still in it. The
//! writer here copies into a fresh `Zeroizing` buffer instead, so every block
//! it lets go of is wiped first.

use std::io;

use serde::Serialize;
use zeroize::Zeroizing;

const INITIAL_CAPACITY: usize = 256;

struct WipingWriter {
    buf: Zeroizing<Vec<u8>>,
}

impl io::Write for WipingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let needed = self.buf.len() + data.len();
        if needed > self.buf.capacity() {
            let capacity = needed.max(self.buf.capacity().saturating_mul(2));
            let mut grown = Zeroizing::new(Vec::with_capacity(capacity));
            grown.extend_from_slice(&self.buf);
            // The old buffer is zeroed as it drops here.
            self.buf = grown;
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialize `value` to JSON without leaving partial copies on the heap.
pub fn to_json<T>(value: &T) -> Result<Zeroizing<Vec<u8>>, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let mut writer = WipingWriter {
        buf: Zeroizing::new(Vec::with_capacity(INITIAL_CAPACITY)),
    };
    serde_json::to_writer(&mut writer, value)?;
    Ok(writer.buf)
}
