//! Демонстрационный бинарник: строит U-Net, выводит формы и прогоняет
//! один прямой проход на CPU со случайными весами.

use rustyunet::analysis::shape_inference::ShapeInference;
use rustyunet::asg::{DType, Shape, Value};
use rustyunet::nn::{ConditionedModule, ConditionedUNet, Module, ParameterStore, UNet, DEFAULT_N_EMB};
use rustyunet::runtime::backend::Backend;
use rustyunet::runtime::cpu_backend::CpuBackend;
use rustyunet::tensor::{GraphContext, Tensor};

use clap::Parser;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "RustyUNet: U-Net forward pass on the CPU backend", long_about = None)]
struct Args {
    /// Число входных каналов
    #[arg(long, default_value_t = 3)]
    in_channels: usize,

    /// Число выходных классов
    #[arg(long, default_value_t = 2)]
    classes: usize,

    /// Ширина первого уровня (каналы после `inc`)
    #[arg(long, default_value_t = 8)]
    base: usize,

    /// Сторона квадратного входного изображения
    #[arg(long, default_value_t = 64)]
    size: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Транспонированная свёртка вместо билинейного апсемплинга
    #[arg(long)]
    transpose: bool,

    /// Модель, обусловленная скаляром (временем)
    #[arg(long)]
    conditioned: bool,

    /// Значение условия для всех элементов батча
    #[arg(long, default_value_t = 0.5)]
    time: f32,

    /// Размер временного эмбеддинга
    #[arg(long, default_value_t = DEFAULT_N_EMB)]
    n_emb: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Фильтр логов, если не задан RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(&args)
}

/// Построение графа, анализ форм и прямой проход.
fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    // ---------- 1. Построение графа ----------
    let context = Rc::new(RefCell::new(GraphContext::new()));
    let image = Tensor::new_input(&context, "image");
    let bilinear = !args.transpose;

    let (output, parameter_count) = if args.conditioned {
        let time = Tensor::new_input(&context, "time");
        let model = ConditionedUNet::new(&context, args.in_channels, args.classes, args.base, bilinear, args.n_emb);
        (model.forward(&image, &time), model.parameter_count())
    } else {
        let model = UNet::new(&context, args.in_channels, args.classes, args.base, bilinear);
        (model.forward(&image), model.parameter_count())
    };

    let mut graph = context.borrow().main_graph().clone();
    graph.set_output(output.node_id);
    info!(
        nodes = graph.nodes.len(),
        parameters = parameter_count,
        conditioned = args.conditioned,
        bilinear,
        "graph built"
    );

    // ---------- 2. Анализ форм ----------
    let image_shape: Shape = vec![args.batch, args.in_channels, args.size, args.size];
    let mut shapes = HashMap::from([("image".to_string(), (image_shape.clone(), DType::F32))]);
    if args.conditioned {
        shapes.insert("time".to_string(), (vec![args.batch, 1], DType::F32));
    }
    ShapeInference::run(&mut graph, &shapes)?;
    let inferred = graph.get_node(output.node_id)?.shape.clone().unwrap_or_default();
    info!(input = ?image_shape, output = ?inferred, "shape inference done");

    // ---------- 3. Данные и параметры ----------
    let mut rng = StdRng::seed_from_u64(args.seed);
    let store = ParameterStore::initialize(&context, args.seed);
    let mut data = HashMap::from([(
        "image".to_string(),
        Value::Tensor(ArrayD::random_using(IxDyn(&image_shape), Uniform::new(-1.0f32, 1.0), &mut rng)),
    )]);
    if args.conditioned {
        data.insert(
            "time".to_string(),
            Value::Tensor(ArrayD::from_elem(IxDyn(&[args.batch, 1]), args.time)),
        );
    }

    // ---------- 4. Прямой проход ----------
    let backend = CpuBackend::new();
    let device_data = backend.load_data(&data)?;
    let started = Instant::now();
    let (outputs, memo) = backend.run(&graph, store.bind(&graph, &device_data))?;
    debug!(cached = memo.len(), "forward memo");

    let result = backend.retrieve_data(&outputs)?;
    let logits = result
        .first()
        .and_then(Value::as_tensor)
        .ok_or("forward pass produced no tensor output")?;
    let mean = logits.mean().unwrap_or(0.0);
    info!(
        shape = ?logits.shape(),
        mean,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "forward pass done"
    );
    Ok(())
}
