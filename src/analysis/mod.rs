//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime. Also owns
//!   the topological sort shared by autograd and the CPU backend.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! Train and eval graphs declare every input shape, so a bad window size or a
//! mismatched layer width is reported while the graph is built. Generate
//! graphs take histories of arbitrary length and are checked by the backend
//! on first run instead.
//!
//! ## Example
//!
//! ```ignore
//! use structured_melody_rnn::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! let shapes = HashMap::from([
//!     ("inputs".to_string(), (vec![64, 128, 38], DType::F32)),
//! ]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;
