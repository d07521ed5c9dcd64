use gradgraph::{
    compile, grad, Axes, DType, Graph, GraphError, LispMachine, MachineOptions, NodeId, TapeMachine,
    Tensor,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const TOL: f64 = 1e-9;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small dense layer with a squared loss:
/// loss = mean(tanh(x @ w + b)^2) + sum(sigmoid(x)) * scale
struct Layer {
    graph: Graph,
    x: NodeId,
    w: NodeId,
    b: NodeId,
    hidden: NodeId,
    loss: NodeId,
}

fn layer() -> Layer {
    let mut graph = Graph::new();
    let x = graph.input("x", DType::F64, vec![3, 2]);
    let w = graph.input("w", DType::F64, vec![2, 4]);
    let b = graph.input("b", DType::F64, vec![4]);
    let xw = graph.matmul(x, w).unwrap();
    let pre = graph.add(xw, b).unwrap();
    let hidden = graph.tanh(pre).unwrap();
    let sq = graph.square(hidden).unwrap();
    let mse = graph.mean(sq, Axes::All, false).unwrap();
    let sx = graph.sigmoid(x).unwrap();
    let total = graph.sum(sx, Axes::All, false).unwrap();
    let scale = graph.scalar(0.25, DType::F64);
    let reg = graph.mul(total, scale).unwrap();
    let loss = graph.add(mse, reg).unwrap();
    Layer {
        graph,
        x,
        w,
        b,
        hidden,
        loss,
    }
}

fn random_inputs(layer: &Layer, seed: u64) -> Vec<(NodeId, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    vec![
        (layer.x, Tensor::random_uniform(vec![3, 2], -1.0, 1.0, &mut rng).unwrap()),
        (layer.w, Tensor::random_normal(vec![2, 4], 0.0, 0.5, &mut rng).unwrap()),
        (layer.b, Tensor::random_uniform(vec![4], -0.1, 0.1, &mut rng).unwrap()),
    ]
}

#[test]
fn tape_and_lisp_agree_on_outputs() {
    init();
    for seed in 0..8 {
        let mut l = layer();
        l.graph.mark_output(l.loss).unwrap();
        l.graph.mark_output(l.hidden).unwrap();
        let inputs = random_inputs(&l, seed);

        let (program, locations) = compile(&l.graph).unwrap();
        let mut tape = TapeMachine::new(program, locations);
        for (node, value) in &inputs {
            tape.bind(*node, value.clone()).unwrap();
        }
        tape.run_all().unwrap();

        let mut lisp = LispMachine::new(&mut l.graph, MachineOptions::default());
        for (node, value) in &inputs {
            lisp.bind(*node, value.clone()).unwrap();
        }
        lisp.run_all().unwrap();

        for node in [l.loss, l.hidden] {
            let a = tape.value(node).unwrap();
            let b = lisp.value(node).unwrap();
            assert!(a.approx_eq(b, TOL), "seed {}: {} vs {}", seed, a, b);
        }
    }
}

#[test]
fn symbolic_and_automatic_gradients_agree() {
    init();
    for seed in 0..8 {
        let mut l = layer();
        l.graph.mark_output(l.loss).unwrap();
        let wrt = [l.x, l.w, l.b];
        grad(&mut l.graph, l.loss, &wrt).unwrap();
        let inputs = random_inputs(&l, seed);

        let (program, locations) = compile(&l.graph).unwrap();
        let mut tape = TapeMachine::new(program, locations);
        for (node, value) in &inputs {
            tape.bind(*node, value.clone()).unwrap();
        }
        tape.run_all().unwrap();

        let mut lisp = LispMachine::new(
            &mut l.graph,
            MachineOptions::new().with_differentiation(true),
        );
        for (node, value) in &inputs {
            lisp.bind(*node, value.clone()).unwrap();
        }
        lisp.run_all().unwrap();

        for node in wrt {
            let symbolic = tape.grad(node).unwrap();
            let automatic = lisp.grad(node).unwrap();
            assert_eq!(symbolic.shape(), automatic.shape());
            assert!(
                symbolic.approx_eq(automatic, TOL),
                "seed {} node {}: {} vs {}",
                seed,
                node,
                symbolic,
                automatic
            );
        }
    }
}

#[test]
fn compilation_is_deterministic() {
    let mut l = layer();
    grad(&mut l.graph, l.loss, &[l.w, l.b]).unwrap();
    let (p1, m1) = compile(&l.graph).unwrap();
    let (p2, m2) = compile(&l.graph).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(m1, m2);
}

#[test]
fn shared_node_gradient_is_sum_of_paths() {
    fn path_grads(paths: &[usize], x0: f64) -> f64 {
        let mut graph = Graph::new();
        let x = graph.scalar_input("x", DType::F64);
        let mut terms = Vec::new();
        for &p in paths {
            let t = match p {
                0 => graph.exp(x).unwrap(),
                1 => graph.mul(x, x).unwrap(),
                _ => graph.sigmoid(x).unwrap(),
            };
            terms.push(t);
        }
        let out = graph.add_n(&terms).unwrap();
        graph.mark_output(out).unwrap();
        graph.bind(x, Tensor::scalar(x0)).unwrap();
        let mut m = LispMachine::new(&mut graph, MachineOptions::new().with_differentiation(true));
        m.run_all().unwrap();
        m.grad(x).unwrap().as_scalar().unwrap()
    }

    let x0 = 0.7;
    let combined = path_grads(&[0, 1, 2], x0);
    let separate: f64 = (0..3).map(|p| path_grads(&[p], x0)).sum();
    assert!((combined - separate).abs() < TOL);
}

#[test]
fn rebinding_same_values_reproduces_results() {
    let mut l = layer();
    l.graph.mark_output(l.loss).unwrap();
    grad(&mut l.graph, l.loss, &[l.w]).unwrap();
    let inputs = random_inputs(&l, 42);

    let (program, locations) = compile(&l.graph).unwrap();
    let mut tape = TapeMachine::new(program, locations);
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        for (node, value) in &inputs {
            tape.bind(*node, value.clone()).unwrap();
        }
        tape.run_all().unwrap();
        snapshots.push((tape.value(l.loss).unwrap().clone(), tape.grad(l.w).unwrap().clone()));
    }
    assert_eq!(snapshots[0], snapshots[1]);

    let mut lisp = LispMachine::new(&mut l.graph, MachineOptions::new().with_differentiation(true));
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        for (node, value) in &inputs {
            lisp.bind(*node, value.clone()).unwrap();
        }
        lisp.run_all().unwrap();
        snapshots.push((lisp.value(l.loss).unwrap().clone(), lisp.grad(l.w).unwrap().clone()));
    }
    assert_eq!(snapshots[0], snapshots[1]);
}

#[test]
fn scenario_a_addition() {
    let mut graph = Graph::new();
    let x = graph.scalar_input("x", DType::F64);
    let y = graph.scalar_input("y", DType::F64);
    let z = graph.add(x, y).unwrap();
    graph.mark_output(z).unwrap();
    graph.bind(x, Tensor::scalar(2.0)).unwrap();
    graph.bind(y, Tensor::scalar(2.5)).unwrap();

    let grads = grad(&mut graph, z, &[x, y]).unwrap();
    assert_eq!(grads.len(), 2);
    let (program, locations) = compile(&graph).unwrap();
    let mut tape = TapeMachine::new(program, locations);
    tape.run_all().unwrap();
    assert_eq!(tape.value(z).unwrap().as_scalar(), Some(4.5));
    assert_eq!(tape.grad(x).unwrap().as_scalar(), Some(1.0));
    assert_eq!(tape.grad(y).unwrap().as_scalar(), Some(1.0));

    let mut lisp = LispMachine::new(&mut graph, MachineOptions::new().with_differentiation(true));
    lisp.run_all().unwrap();
    assert_eq!(lisp.value(z).unwrap().as_scalar(), Some(4.5));
    assert_eq!(lisp.grad(x).unwrap().as_scalar(), Some(1.0));
    assert_eq!(lisp.grad(y).unwrap().as_scalar(), Some(1.0));
}

#[test]
fn scenario_b_square() {
    let mut graph = Graph::new();
    let x = graph.scalar_input("x", DType::F64);
    let two = graph.scalar(2.0, DType::F64);
    let y = graph.pow(x, two).unwrap();
    graph.mark_output(y).unwrap();
    graph.bind(x, Tensor::scalar(3.0)).unwrap();
    grad(&mut graph, y, &[x]).unwrap();

    let (program, locations) = compile(&graph).unwrap();
    let mut tape = TapeMachine::new(program, locations);
    tape.run_all().unwrap();
    assert!((tape.value(y).unwrap().as_scalar().unwrap() - 9.0).abs() < TOL);
    assert!((tape.grad(x).unwrap().as_scalar().unwrap() - 6.0).abs() < TOL);

    let mut lisp = LispMachine::new(&mut graph, MachineOptions::new().with_differentiation(true));
    lisp.run_all().unwrap();
    assert!((lisp.grad(x).unwrap().as_scalar().unwrap() - 6.0).abs() < TOL);
}

#[test]
fn scenario_c_shape_error_at_construction() {
    let mut graph = Graph::new();
    let a = graph.input("a", DType::F64, vec![2, 3]);
    let b = graph.input("b", DType::F64, vec![4]);
    let before = graph.len();
    assert!(matches!(graph.add(a, b), Err(GraphError::Shape { op: "add", .. })));
    assert_eq!(graph.len(), before);
}

#[test]
fn scenario_d_no_path_leaves_graph_untouched() {
    let mut graph = Graph::new();
    let x = graph.scalar_input("x", DType::F64);
    let y = graph.scalar_input("y", DType::F64);
    let z = graph.exp(x).unwrap();
    let before = graph.clone();

    assert_eq!(
        grad(&mut graph, z, &[y]),
        Err(GraphError::NoPath { output: z, wrt: y })
    );
    assert_eq!(graph, before);
}

#[test]
fn gradients_agree_without_declared_outputs() {
    init();
    let mut l = layer();
    let wrt = [l.x, l.w, l.b];
    grad(&mut l.graph, l.loss, &wrt).unwrap();
    assert!(l.graph.outputs().is_empty());
    assert_eq!(l.graph.roots(), vec![l.loss]);
    let inputs = random_inputs(&l, 11);

    let (program, locations) = compile(&l.graph).unwrap();
    let mut tape = TapeMachine::new(program, locations);
    for (node, value) in &inputs {
        tape.bind(*node, value.clone()).unwrap();
    }
    tape.run_all().unwrap();

    let mut lisp = LispMachine::new(&mut l.graph, MachineOptions::new().with_differentiation(true));
    for (node, value) in &inputs {
        lisp.bind(*node, value.clone()).unwrap();
    }
    lisp.run_all().unwrap();

    assert!(tape.value(l.loss).unwrap().approx_eq(lisp.value(l.loss).unwrap(), TOL));
    for node in wrt {
        let symbolic = tape.grad(node).unwrap();
        let automatic = lisp.grad(node).unwrap();
        assert!(symbolic.approx_eq(automatic, TOL), "node {}: {} vs {}", node, symbolic, automatic);
    }
}

#[test]
fn scenario_b_without_declared_outputs() {
    let mut graph = Graph::new();
    let x = graph.scalar_input("x", DType::F64);
    let two = graph.scalar(2.0, DType::F64);
    let y = graph.pow(x, two).unwrap();
    graph.bind(x, Tensor::scalar(3.0)).unwrap();
    grad(&mut graph, y, &[x]).unwrap();

    let (program, locations) = compile(&graph).unwrap();
    let mut tape = TapeMachine::new(program, locations);
    tape.run_all().unwrap();
    assert!((tape.value(y).unwrap().as_scalar().unwrap() - 9.0).abs() < TOL);
    assert!((tape.grad(x).unwrap().as_scalar().unwrap() - 6.0).abs() < TOL);

    let mut lisp = LispMachine::new(&mut graph, MachineOptions::new().with_differentiation(true));
    lisp.run_all().unwrap();
    assert!((lisp.value(y).unwrap().as_scalar().unwrap() - 9.0).abs() < TOL);
    assert!((lisp.grad(x).unwrap().as_scalar().unwrap() - 6.0).abs() < TOL);
}
