//! # RustyUNet: U-Net building blocks on a graph-based engine
//!
//! Layers append nodes to an **Abstract Semantic Graph (ASG)** instead of
//! computing eagerly. The same graph is then shape-checked, differentiated
//! and executed on a backend.
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::cell::RefCell;
//! use rustyunet::nn::{Module, ParameterStore, UNet};
//! use rustyunet::tensor::{GraphContext, Tensor};
//!
//! // 1. Create graph context
//! let context = Rc::new(RefCell::new(GraphContext::new()));
//!
//! // 2. Define symbolic input and build the model graph
//! let image = Tensor::new_input(&context, "image");
//! let unet = UNet::new(&context, 3, 2, 16, true);
//! let logits = unet.forward(&image);
//!
//! // 3. Draw concrete weights for every registered parameter
//! let params = ParameterStore::initialize(&context, 42);
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod nn;
pub mod runtime;
pub mod tensor;
