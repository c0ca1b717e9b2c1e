//! # Graph Analysis Module
//!
//! This module contains analysis passes that process the ASG before execution.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use rustyunet::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! graph.set_output(output.node_id);
//!
//! // Parameters carry their shapes already; only inputs need one.
//! let shapes = HashMap::from([
//!     ("input".to_string(), (vec![1, 3, 64, 64], DType::F32)),
//! ]);
//!
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;
