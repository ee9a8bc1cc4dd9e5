pub mod artwork;
pub mod event;
pub mod hash;
pub mod track;
