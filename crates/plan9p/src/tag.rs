//! Tag bookkeeping.
//!
//! A client hands out tags to outstanding requests and matches responses back
//! to them. A server remembers which tags are in flight so it can reject
//! duplicates and suppress answers to flushed requests.

use {
    crate::{
        error::{Error, string::*},
        utils::Result,
    },
    std::collections::{HashSet, VecDeque},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Pending {
    tag: u16,
    /// Tag of the `Tflush` aimed at this request, if any.
    flushed_by: Option<u16>,
}

/// Client side tag allocation.
///
/// Tags are issued in increasing order modulo 65536, skipping any tag still
/// outstanding. Tversion goes out with tag 0, so `NOTAG` is an ordinary tag.
/// Responses must come back in issue order, except that an `Rflush` may
/// overtake the request it cancelled.
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: u16,
    pending: VecDeque<Pending>,
}

impl TagAllocator {
    pub fn new() -> TagAllocator {
        Default::default()
    }

    /// Reserve a fresh tag for a request.
    pub fn alloc(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let tag = self.next;
            self.next = self.next.wrapping_add(1);
            if self.is_pending(tag) {
                continue;
            }
            self.pending.push_back(Pending {
                tag,
                flushed_by: None,
            });
            return Ok(tag);
        }
        Err(Error::No(EDUPTAG))
    }

    /// Reserve a tag for a `Tflush` cancelling `oldtag`.
    pub fn alloc_flush(&mut self, oldtag: u16) -> Result<u16> {
        let tag = self.alloc()?;
        if let Some(p) = self.pending.iter_mut().find(|p| p.tag == oldtag) {
            p.flushed_by = Some(tag);
        }
        Ok(tag)
    }

    pub fn is_pending(&self, tag: u16) -> bool {
        self.pending.iter().any(|p| p.tag == tag)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Retire `tag` on receipt of its response.
    ///
    /// Requests cancelled by this tag are retired first. Anything else that
    /// arrives out of order is a protocol botch.
    pub fn complete(&mut self, tag: u16) -> Result<()> {
        self.pending.retain(|p| p.flushed_by != Some(tag));
        match self.pending.front() {
            Some(p) if p.tag == tag => {
                self.pending.pop_front();
                Ok(())
            }
            Some(p) => Err(Error::botch(format!(
                "response for tag {} while waiting for tag {}",
                tag, p.tag
            ))),
            None => Err(Error::botch(format!("unsolicited response for tag {}", tag))),
        }
    }

    /// Forget every outstanding tag and restart numbering at 0.
    pub fn reset(&mut self) {
        self.next = 0;
        self.pending.clear();
    }
}

/// Server side record of the requests a connection has in flight.
#[derive(Debug, Default)]
pub struct PendingTags {
    inflight: HashSet<u16>,
    flushed: HashSet<u16>,
}

impl PendingTags {
    pub fn new() -> PendingTags {
        Default::default()
    }

    /// Note that a request with `tag` has arrived.
    pub fn begin(&mut self, tag: u16) -> Result<()> {
        if !self.inflight.insert(tag) {
            return Err(Error::No(EDUPTAG));
        }
        Ok(())
    }

    /// Mark `oldtag` as flushed. Returns whether it was still in flight.
    pub fn flush(&mut self, oldtag: u16) -> bool {
        if self.inflight.contains(&oldtag) {
            self.flushed.insert(oldtag);
            true
        } else {
            false
        }
    }

    /// Retire `tag`. Returns `false` if its response must not be sent.
    pub fn finish(&mut self, tag: u16) -> bool {
        self.inflight.remove(&tag);
        !self.flushed.remove(&tag)
    }

    pub fn reset(&mut self) {
        self.inflight.clear();
        self.flushed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_wrap_after_65535() {
        let mut tags = TagAllocator::new();
        tags.next = 65534;
        assert_eq!(tags.alloc().unwrap(), 65534);
        tags.complete(65534).unwrap();
        assert_eq!(tags.alloc().unwrap(), 65535);
        tags.complete(65535).unwrap();
        assert_eq!(tags.alloc().unwrap(), 0);
        tags.complete(0).unwrap();
        assert_eq!(tags.alloc().unwrap(), 1);
    }

    #[test]
    fn outstanding_tags_are_not_reused() {
        let mut tags = TagAllocator::new();
        let first = tags.alloc().unwrap();
        tags.next = first;
        let second = tags.alloc().unwrap();
        assert_ne!(first, second);
        assert_eq!(tags.outstanding(), 2);
    }

    #[test]
    fn responses_out_of_order_are_a_botch() {
        let mut tags = TagAllocator::new();
        let a = tags.alloc().unwrap();
        let b = tags.alloc().unwrap();
        assert!(matches!(tags.complete(b), Err(Error::Protocol(_))));
        tags.complete(a).unwrap();
        tags.complete(b).unwrap();
        assert!(tags.complete(a).is_err());
    }

    #[test]
    fn rflush_retires_the_cancelled_request() {
        let mut tags = TagAllocator::new();
        let read = tags.alloc().unwrap();
        let flush = tags.alloc_flush(read).unwrap();
        tags.complete(flush).unwrap();
        assert!(!tags.is_pending(read));
        assert_eq!(tags.outstanding(), 0);
    }

    #[test]
    fn reset_restarts_at_zero() {
        let mut tags = TagAllocator::new();
        tags.alloc().unwrap();
        tags.alloc().unwrap();
        tags.reset();
        assert_eq!(tags.alloc().unwrap(), 0);
    }

    #[test]
    fn server_tracks_duplicates_and_flushes() {
        let mut tags = PendingTags::new();
        tags.begin(7).unwrap();
        assert!(matches!(tags.begin(7), Err(Error::No(EDUPTAG))));
        assert!(tags.flush(7));
        assert!(!tags.flush(8));
        assert!(!tags.finish(7));
        tags.begin(7).unwrap();
        assert!(tags.finish(7));
    }
}
