//! Scatter/gather buffer lists.
//!
//! Requests carry lists of caller buffers: [`IoVector`] for data to be written, [`IoVectorMut`]
//! for reads.  Both split at arbitrary byte positions, which is how requests are cut into
//! per-cluster pieces without copying.

use std::fmt::{self, Debug, Formatter};

/// Total length of `pieces`.
fn total_len<S: AsRef<[u8]>>(pieces: &[S]) -> u64 {
    pieces.iter().map(|p| p.as_ref().len() as u64).sum()
}

/// Cut `pieces` after `mid` bytes, using `split` on the piece containing that position.
///
/// A `mid` beyond the end puts everything into the head.
fn cut<S: AsRef<[u8]>>(
    pieces: Vec<S>,
    mid: u64,
    split: impl Fn(S, usize) -> (S, S),
) -> (Vec<S>, Vec<S>) {
    let mut head = Vec::with_capacity(pieces.len());
    let mut tail = Vec::new();
    let mut left = mid;

    for piece in pieces {
        let len = piece.as_ref().len() as u64;
        if left >= len {
            left -= len;
            head.push(piece);
        } else if left == 0 {
            tail.push(piece);
        } else {
            let (a, b) = split(piece, left as usize);
            head.push(a);
            tail.push(b);
            left = 0;
        }
    }
    (head, tail)
}

/// Buffers holding data to be written.
#[derive(Default)]
pub struct IoVector<'a> {
    pieces: Vec<&'a [u8]>,
    len: u64,
}

/// Buffers to be filled by a read.
#[derive(Default)]
pub struct IoVectorMut<'a> {
    pieces: Vec<&'a mut [u8]>,
    len: u64,
}

impl<'a> IoVector<'a> {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `buf` at the end.
    pub fn push(&mut self, buf: &'a [u8]) {
        self.len += buf.len() as u64;
        self.pieces.push(buf);
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether there are no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first `mid` bytes, and the rest.
    pub fn split_at(self, mid: u64) -> (Self, Self) {
        let (head, tail) = cut(self.pieces, mid, |piece, at| piece.split_at(at));
        (head.into(), tail.into())
    }

    /// The buffers in order.
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.pieces.iter().copied()
    }

    /// Gather everything into `dest`, which must have exactly our length.
    pub fn copy_into_slice(&self, dest: &mut [u8]) {
        assert_eq!(dest.len() as u64, self.len);
        let mut rest = dest;
        for piece in &self.pieces {
            let (here, after) = std::mem::take(&mut rest).split_at_mut(piece.len());
            here.copy_from_slice(piece);
            rest = after;
        }
    }
}

impl<'a> IoVectorMut<'a> {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `buf` at the end.
    pub fn push(&mut self, buf: &'a mut [u8]) {
        self.len += buf.len() as u64;
        self.pieces.push(buf);
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether there are no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first `mid` bytes, and the rest.
    pub fn split_at(self, mid: u64) -> (Self, Self) {
        let (head, tail) = cut(self.pieces, mid, |piece, at| piece.split_at_mut(at));
        (head.into(), tail.into())
    }

    /// The buffers in order.
    pub fn iter_mut<'s>(&'s mut self) -> impl Iterator<Item = &'s mut [u8]> + use<'s, 'a> {
        self.pieces.iter_mut().map(|piece| &mut **piece)
    }

    /// Set every byte to `value`.
    pub fn fill(&mut self, value: u8) {
        self.iter_mut().for_each(|piece| piece.fill(value));
    }

    /// Scatter `src`, which must have exactly our length, into the buffers.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert_eq!(src.len() as u64, self.len);
        let mut rest = src;
        for piece in self.iter_mut() {
            let (here, after) = rest.split_at(piece.len());
            piece.copy_from_slice(here);
            rest = after;
        }
    }
}

impl<'a> From<Vec<&'a [u8]>> for IoVector<'a> {
    fn from(pieces: Vec<&'a [u8]>) -> Self {
        let len = total_len(&pieces);
        IoVector { pieces, len }
    }
}

impl<'a> From<Vec<&'a mut [u8]>> for IoVectorMut<'a> {
    fn from(pieces: Vec<&'a mut [u8]>) -> Self {
        let len = total_len(&pieces);
        IoVectorMut { pieces, len }
    }
}

impl<'a> From<&'a [u8]> for IoVector<'a> {
    fn from(buf: &'a [u8]) -> Self {
        vec![buf].into()
    }
}

impl<'a> From<&'a mut [u8]> for IoVectorMut<'a> {
    fn from(buf: &'a mut [u8]) -> Self {
        vec![buf].into()
    }
}

impl<'a> From<&'a Vec<u8>> for IoVector<'a> {
    fn from(buf: &'a Vec<u8>) -> Self {
        buf.as_slice().into()
    }
}

impl<'a> From<&'a mut Vec<u8>> for IoVectorMut<'a> {
    fn from(buf: &'a mut Vec<u8>) -> Self {
        buf.as_mut_slice().into()
    }
}

impl Debug for IoVector<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "IoVector({} bytes in {} buffers)", self.len, self.pieces.len())
    }
}

impl Debug for IoVectorMut<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "IoVectorMut({} bytes in {} buffers)", self.len, self.pieces.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_in_the_middle_of_a_buffer() {
        let a = [1u8; 3];
        let b = [2u8; 5];
        let v = IoVector::from(vec![&a[..], &b[..]]);
        assert_eq!(v.len(), 8);

        let (head, tail) = v.split_at(4);
        assert_eq!(head.len(), 4);
        assert_eq!(head.iter().count(), 2);
        assert_eq!(tail.len(), 4);
        assert_eq!(tail.iter().count(), 1);

        let mut out = [0u8; 4];
        head.copy_into_slice(&mut out);
        assert_eq!(out, [1, 1, 1, 2]);
        tail.copy_into_slice(&mut out);
        assert_eq!(out, [2, 2, 2, 2]);
    }

    #[test]
    fn split_at_buffer_edges() {
        let a = [0u8; 16];
        let (head, tail) = IoVector::from(&a[..]).split_at(100);
        assert_eq!(head.len(), 16);
        assert!(tail.is_empty());

        let (head, tail) = IoVector::from(vec![&a[..8], &a[8..]]).split_at(8);
        assert_eq!((head.iter().count(), tail.iter().count()), (1, 1));
        assert_eq!(format!("{tail:?}"), "IoVector(8 bytes in 1 buffers)");
    }

    #[test]
    fn fill_and_copy_from_slice() {
        let mut a = vec![0u8; 2];
        let mut b = vec![0u8; 6];
        {
            let mut v = IoVectorMut::from(vec![a.as_mut_slice(), b.as_mut_slice()]);
            v.fill(7);
            let (mut head, _) = v.split_at(3);
            head.copy_from_slice(&[1, 2, 3]);
        }
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [3, 7, 7, 7, 7, 7]);
    }

    #[test]
    fn iter_mut_reaches_every_buffer() {
        let mut a = vec![0u8; 3];
        let mut b = vec![0u8; 1];
        {
            let mut v = IoVectorMut::from(vec![a.as_mut_slice(), b.as_mut_slice()]);
            for (i, buf) in v.iter_mut().enumerate() {
                buf.fill(i as u8 + 1);
            }
            let lens: Vec<usize> = v.iter_mut().map(|buf| buf.len()).collect();
            assert_eq!(lens, [3, 1]);
            assert_eq!(v.len(), 4);
        }
        assert_eq!(a, [1, 1, 1]);
        assert_eq!(b, [2]);
    }
}
