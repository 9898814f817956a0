//! Infrastructure layer: persistence, external collaborators and the
//! background consulta engine that drives them.

pub mod jobs;
