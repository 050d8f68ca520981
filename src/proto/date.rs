use std::cell::RefCell;
use std::time::{Duration, Instant, SystemTime};

/// The rendered length of an HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

// Rendering the Date header is surprisingly hot on keep-alive workloads;
// cache the formatted value per thread and refresh it at second granularity.
thread_local! {
    static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new());
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    rendered_at: Instant,
}

impl CachedDate {
    fn new() -> CachedDate {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            rendered_at: Instant::now(),
        };
        cache.render();
        cache
    }

    fn render(&mut self) {
        let now = httpdate::fmt_http_date(SystemTime::now());
        self.bytes.copy_from_slice(now.as_bytes());
        self.rendered_at = Instant::now();
    }
}

pub(crate) fn extend(dst: &mut bytes::BytesMut) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.rendered_at.elapsed() >= Duration::from_secs(1) {
            cache.render();
        }
        dst.extend_from_slice(&cache.bytes);
    })
}
