pub mod error;
pub mod tokenizer;
pub mod budget;
pub mod packer;
pub mod assemble;
pub mod model;
pub mod transformer;
pub mod training;
pub mod loss;
pub mod sampler;
pub mod perturb;
pub mod dataset;
pub mod trajectory;
pub mod logging;
pub mod config;
pub mod trainer;
pub mod rao;
pub mod external;
pub mod evaluate;
pub mod pipeline;
