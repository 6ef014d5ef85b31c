//! Fixed-capacity byte buffers and a pool that recycles them.
//!
//! A [`DataBuffer`](buffer::DataBuffer) is the unit of network I/O: a boxed slice that never
//! grows, plus a cursor recording how many of its bytes are valid. Objects larger than one
//! buffer are spread across several buffers by the codec above this crate.
//!
//! A [`BufferPool`](pool::BufferPool) hands out buffers and takes them back. An empty pool is
//! not an error, it is how backpressure is expressed: callers try again after other buffers
//! have been released.
//!
//! # Examples
//!
//! ```
//! use weft_bytes::pool::BufferPool;
//!
//! let mut pool = BufferPool::new(64, 2);
//! let mut first = pool.acquire().expect("pool starts full");
//! let second = pool.acquire().expect("pool starts full");
//! assert!(pool.acquire().is_none());
//!
//! // a 100 byte payload does not fit in one 64 byte buffer.
//! let payload = vec![7u8; 100];
//! let copied = first.extend_from_slice(&payload);
//! assert_eq!(copied, 64);
//! assert_eq!(first.remaining(), 0);
//!
//! pool.release(first);
//! pool.release(second);
//! assert_eq!(pool.available(), 2);
//! ```
#![forbid(missing_docs)]

/// A byte buffer of fixed capacity with a valid-length cursor.
pub mod buffer {

    use byteorder::{BigEndian, ByteOrder};

    /// A byte buffer of fixed capacity.
    ///
    /// The bytes `[.. size]` are valid, either written by a producer or filled by a read.
    /// The bytes `[size ..]` are spare capacity. The buffer is never resized.
    pub struct DataBuffer {
        bytes: Box<[u8]>,
        size: usize,
        connection: Option<usize>,
    }

    impl DataBuffer {
        /// Allocates a zeroed buffer of `capacity` bytes.
        pub fn new(capacity: usize) -> Self {
            DataBuffer {
                bytes: vec![0u8; capacity].into_boxed_slice(),
                size: 0,
                connection: None,
            }
        }
        /// The fixed number of bytes the buffer can hold.
        #[inline] pub fn capacity(&self) -> usize { self.bytes.len() }
        /// The number of valid bytes.
        #[inline] pub fn size(&self) -> usize { self.size }
        /// Spare capacity after the valid bytes.
        #[inline] pub fn remaining(&self) -> usize { self.bytes.len() - self.size }
        /// True when no bytes are valid.
        #[inline] pub fn is_empty(&self) -> bool { self.size == 0 }
        /// The valid region.
        #[inline] pub fn valid(&self) -> &[u8] { &self.bytes[.. self.size] }
        /// The spare region, to be written and then marked with `make_valid`.
        #[inline] pub fn spare(&mut self) -> &mut [u8] { &mut self.bytes[self.size ..] }

        /// Marks the next `bytes` spare bytes as valid.
        #[inline]
        pub fn make_valid(&mut self, bytes: usize) {
            assert!(self.size + bytes <= self.bytes.len());
            self.size += bytes;
        }

        /// Sets the number of valid bytes.
        #[inline]
        pub fn set_size(&mut self, size: usize) {
            assert!(size <= self.bytes.len());
            self.size = size;
        }

        /// Forgets all valid bytes and the connection tag.
        pub fn clear(&mut self) {
            self.size = 0;
            self.connection = None;
        }

        /// Copies as much of `source` as fits, returning the number of bytes copied.
        pub fn extend_from_slice(&mut self, source: &[u8]) -> usize {
            let count = std::cmp::min(source.len(), self.remaining());
            self.bytes[self.size .. self.size + count].copy_from_slice(&source[.. count]);
            self.size += count;
            count
        }

        /// Appends a big-endian `i32`, returning false if four bytes do not fit.
        pub fn put_i32(&mut self, value: i32) -> bool {
            if self.remaining() < 4 { return false; }
            BigEndian::write_i32(&mut self.bytes[self.size .. self.size + 4], value);
            self.size += 4;
            true
        }

        /// Reads a big-endian `i32` from the valid region at `offset`.
        pub fn get_i32(&self, offset: usize) -> Option<i32> {
            if offset + 4 > self.size { return None; }
            Some(BigEndian::read_i32(&self.bytes[offset .. offset + 4]))
        }

        /// The connection that filled (or will drain) this buffer, if any.
        #[inline] pub fn connection(&self) -> Option<usize> { self.connection }
        /// Tags the buffer with its owning connection.
        #[inline] pub fn set_connection(&mut self, connection: Option<usize>) { self.connection = connection; }
    }

    impl std::fmt::Debug for DataBuffer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DataBuffer")
                .field("capacity", &self.capacity())
                .field("size", &self.size)
                .field("connection", &self.connection)
                .finish()
        }
    }

    impl From<Vec<u8>> for DataBuffer {
        /// Wraps a vector as a completely valid buffer.
        fn from(bytes: Vec<u8>) -> Self {
            let size = bytes.len();
            DataBuffer { bytes: bytes.into_boxed_slice(), size, connection: None }
        }
    }
}

/// A bounded supply of equally sized buffers.
pub mod pool {

    use super::buffer::DataBuffer;

    /// A bounded supply of equally sized buffers.
    ///
    /// The pool is filled at construction and never allocates afterwards. Buffers released
    /// with the wrong capacity, or while none are out, are dropped rather than retained.
    pub struct BufferPool {
        buffer_size:    usize,              // capacity of every pooled buffer.
        count:          usize,              // number of buffers the pool owns.
        stash:          Vec<DataBuffer>,    // buffers ready to hand out.
        outstanding:    usize,              // buffers handed out and not yet returned.
    }

    impl BufferPool {
        /// Allocates `count` buffers of `buffer_size` bytes each.
        pub fn new(buffer_size: usize, count: usize) -> Self {
            BufferPool {
                buffer_size,
                count,
                stash: (0 .. count).map(|_| DataBuffer::new(buffer_size)).collect(),
                outstanding: 0,
            }
        }

        /// Takes an empty buffer from the pool, or `None` if every buffer is in use.
        pub fn acquire(&mut self) -> Option<DataBuffer> {
            let mut buffer = self.stash.pop()?;
            buffer.clear();
            self.outstanding += 1;
            Some(buffer)
        }

        /// Returns a buffer to the pool. Returns false if the buffer was dropped instead.
        ///
        /// Only buffers of the pool's size are taken back, and only while some are out.
        pub fn release(&mut self, mut buffer: DataBuffer) -> bool {
            if buffer.capacity() != self.buffer_size || self.outstanding == 0 {
                return false;
            }
            self.outstanding -= 1;
            buffer.clear();
            self.stash.push(buffer);
            true
        }

        /// The number of buffers ready to be acquired.
        pub fn available(&self) -> usize { self.stash.len() }
        /// The number of buffers acquired and not yet released.
        pub fn outstanding(&self) -> usize { self.outstanding }
        /// The capacity of each pooled buffer.
        pub fn buffer_size(&self) -> usize { self.buffer_size }
        /// The number of buffers the pool was created with.
        pub fn count(&self) -> usize { self.count }
    }
}

#[cfg(test)]
mod test {

    use super::buffer::DataBuffer;
    use super::pool::BufferPool;

    #[test]
    fn put_and_get_big_endian() {
        let mut buffer = DataBuffer::new(10);
        assert!(buffer.put_i32(-2));
        assert!(buffer.put_i32(0x01020304));
        assert!(!buffer.put_i32(5));
        assert_eq!(buffer.size(), 8);
        assert_eq!(&buffer.valid()[4..], &[1, 2, 3, 4]);
        assert_eq!(buffer.get_i32(0), Some(-2));
        assert_eq!(buffer.get_i32(4), Some(0x01020304));
        assert_eq!(buffer.get_i32(6), None);
    }

    #[test]
    fn spare_and_make_valid() {
        let mut buffer = DataBuffer::new(8);
        buffer.spare()[..3].copy_from_slice(b"abc");
        buffer.make_valid(3);
        assert_eq!(buffer.valid(), b"abc");
        assert_eq!(buffer.remaining(), 5);
        buffer.set_connection(Some(3));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.connection(), None);
    }

    #[test]
    fn pool_exhaustion_is_not_fatal() {
        let mut pool = BufferPool::new(16, 3);
        let held: Vec<_> = (0 .. 3).filter_map(|_| pool.acquire()).collect();
        assert_eq!(held.len(), 3);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 3);
        for buffer in held { pool.release(buffer); }
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn pool_drops_foreign_buffers() {
        let mut pool = BufferPool::new(16, 1);
        assert!(!pool.release(DataBuffer::new(32)));
        assert_eq!(pool.available(), 1);
        let mut buffer = pool.acquire().expect("one buffer");
        buffer.extend_from_slice(b"dirty");
        assert!(pool.release(buffer));
        let buffer = pool.acquire().expect("returned buffer");
        assert!(buffer.is_empty());
    }

    #[test]
    fn foreign_buffers_leave_the_count_alone() {
        let mut pool = BufferPool::new(16, 2);
        let held = pool.acquire().expect("one buffer");
        assert!(!pool.release(DataBuffer::new(8)));
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.release(held));
        // nothing is out, so an extra buffer of the right size is not retained.
        assert!(!pool.release(DataBuffer::new(16)));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
    }
}
