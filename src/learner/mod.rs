// src/learner/mod.rs — Learning chain: why prompts failed, carried across iterations

pub mod extractor;
pub mod types;
