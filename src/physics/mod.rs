pub mod diffraction;
pub mod link_budget;
pub mod los;
pub mod refraction;
