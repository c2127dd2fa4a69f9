
/// Fixed-size window over the most recent `N` samples, used for round trip times.
pub struct RollingData<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: f64,
    last: Option<f64>,
}
impl<const N: usize> RollingData<N> {
    pub fn new() -> Self {
        assert!(N > 0);

        RollingData {
            buf: BufferImpl::new(),
            cached_sum: 0.0,
            last: None,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
        }

        self.cached_sum += value;
        self.last = Some(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sum / self.buf.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.buf.values().iter()
            .cloned()
            .reduce(f64::min)
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

impl<const N: usize> Default for RollingData<N> {
    fn default() -> Self {
        Self::new()
    }
}


enum BufferImpl<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl <const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(Vec::with_capacity(N))
    }

    fn len(&self) -> usize {
        self.values().len()
    }

    fn values(&self) -> &[f64] {
        match self {
            BufferImpl::Growing(buf) => buf,
            BufferImpl::Ring { buf, .. } => buf,
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
