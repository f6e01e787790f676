//! Shared scaffolding for the blocked algorithms.
//!
//! Every driver walks the diagonal in panels of at most `blocksize` indices
//! and follows the same shape: pull the diagonal block onto every process,
//! run a sequential kernel, write it back, then update the trailing matrix
//! from one or two redistributed panel copies.

use crate::comm::Comm;
use crate::dense::DistMatrix;
use crate::error::{Error, Result};
use crate::field::Field;

/// One step of the panel cursor: global indices `k..end` with `end - k = nb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Panel {
    pub k: usize,
    pub nb: usize,
    pub end: usize,
}

/// Panels of at most `blocksize` indices covering `0..n`.
pub fn panels(n: usize, blocksize: usize) -> Result<impl Iterator<Item = Panel>> {
    if blocksize == 0 {
        return Err(Error::ZeroBlocksize);
    }
    Ok((0..n).step_by(blocksize).map(move |k| {
        let nb = blocksize.min(n - k);
        Panel { k, nb, end: k + nb }
    }))
}

pub fn require_square<T: Field, C: Comm>(a: &DistMatrix<T, C>) -> Result<()> {
    if !a.is_square() {
        return Err(Error::NonSquareMatrix {
            height: a.height(),
            width: a.width(),
        });
    }
    Ok(())
}

pub fn require_same_shape<T: Field, C: Comm>(
    a: &DistMatrix<T, C>,
    b: &DistMatrix<T, C>,
) -> Result<()> {
    if a.height() != b.height() || a.width() != b.width() {
        return Err(Error::Nonconformal(format!(
            "{}x{} does not conform with {}x{}",
            a.height(),
            a.width(),
            b.height(),
            b.width()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panels_cover_the_range_exactly() {
        let steps: Vec<Panel> = panels(10, 4).unwrap().collect();
        assert_eq!(
            steps,
            vec![
                Panel { k: 0, nb: 4, end: 4 },
                Panel { k: 4, nb: 4, end: 8 },
                Panel { k: 8, nb: 2, end: 10 },
            ]
        );
        assert!(panels(10, 0).is_err());
        assert_eq!(panels(0, 4).unwrap().count(), 0);
    }
}
