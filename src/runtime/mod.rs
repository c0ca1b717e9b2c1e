//! Исполнительные среды (бэкенды) для ASG.
//!
//! Каждый подмодуль здесь представляет собой бэкенд, способный
//! выполнить граф вычислений.

pub mod backend;
pub mod cpu_backend;
