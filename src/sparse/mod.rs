//! Complex-valued sparse linear algebra shared by every power-flow
//! kernel: block assembly ([`stack`]), conjugate/real/imag extraction
//! ([`conj`]), real-to-complex casting ([`cast`]), arbitrary submatrix
//! selection ([`slice`]), and the direct solver contract ([`lu`]).
//!
//! Kept close to the teacher's own `basic::sparse` module; nothing here
//! is specific to Newton's method, so the Jacobian-family kernels and
//! the HELM kernel share it unchanged.

pub mod cast;
pub mod conj;
pub mod lu;
pub mod slice;
pub mod stack;

pub(crate) use cast::Cast;
pub(crate) use conj::{Conjugate, RealImage};
pub use lu::{RSparseSolver, Solve};
pub use slice::{slice_csc_matrix, slice_csc_matrix_block};
pub use stack::{Format, SparseMatrix, csc_hstack, csc_vstack, csr_hstack, csr_vstack};
