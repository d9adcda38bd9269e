//! Wire-level protocol test
//!
//! Drives two parties phase by phase, passing every request and response
//! through its JSON encoding as a transport would.

use anyhow::{bail, Context, Result};
use fedgb_core::{Error, Features, FgbParameter, MetricType, Role, TrainOptions};
use fedgb_crypto::PaillierTool;
use fedgb_model::message::{
    Direction, EncryptedGradHess, P1Request, P3Request, P4Request, RoutingQuery,
};
use fedgb_model::{FederatedGbModel, InferenceData, Message, TrainingHandle};

const SAMPLES: usize = 40;

struct WireParty {
    name: &'static str,
    model: FederatedGbModel<PaillierTool>,
    handle: TrainingHandle,
    raw: Vec<Vec<String>>,
    features: Features,
}

impl WireParty {
    fn new(name: &'static str, raw: Vec<Vec<String>>, features: Features) -> Result<Self> {
        let mut model = FederatedGbModel::new(PaillierTool::default());
        let handle = model.train_init(
            &raw,
            &uids(),
            &[],
            parameter(),
            &features,
            TrainOptions::default(),
        )?;
        Ok(Self {
            name,
            model,
            handle,
            raw,
            features,
        })
    }

    /// Decode the request, run the phase and encode the response
    fn handle(&mut self, phase: i32, request: &str) -> Result<String> {
        let message = Message::from_json(request)?;
        let response = self.model.train(phase, message, &self.handle)?;
        Ok(response.to_json()?)
    }
}

fn uids() -> Vec<String> {
    (0..SAMPLES).map(|i| format!("s{i:02}")).collect()
}

fn parameter() -> FgbParameter {
    FgbParameter {
        objective: "binary:logistic".to_string(),
        num_bin: 4,
        max_depth: 1,
        bit_length: 256,
        eval_metric: vec![MetricType::Auc],
        ..Default::default()
    }
}

/// Active party `a` holds a constant feature and the label; passive `b`
/// holds a feature that orders the samples by label
fn parties() -> Result<(WireParty, WireParty)> {
    let mut a_raw = vec![vec!["uid".to_string(), "a1".to_string(), "y".to_string()]];
    let mut b_raw = vec![vec!["uid".to_string(), "b1".to_string()]];
    for (i, uid) in uids().into_iter().enumerate() {
        let label = u8::from(i >= SAMPLES / 2);
        a_raw.push(vec![uid.clone(), "1".to_string(), label.to_string()]);
        b_raw.push(vec![uid, format!("{:.3}", i as f64 / SAMPLES as f64)]);
    }

    let a = WireParty::new("a", a_raw, Features::from_names("uid", &["a1"], Some("y")))?;
    let b = WireParty::new("b", b_raw, Features::from_names("uid", &["b1"], None))?;
    Ok((a, b))
}

fn encode(message: Message) -> Result<String> {
    Ok(message.to_json()?)
}

fn decode(json: &str) -> Result<Message> {
    Ok(Message::from_json(json)?)
}

/// One node round over the wire; returns whether the tree finished
fn node_round(a: &mut WireParty, b: &mut WireParty, new_tree: bool) -> Result<bool> {
    let p1 = |client: &str| {
        encode(Message::P1Request(P1Request {
            client: client.to_string(),
            new_tree,
        }))
    };
    let opened = a.handle(1, &p1(a.name)?)?;
    assert!(!opened.contains("private"), "phase 1 leaked key material");
    let gh = match decode(&opened)? {
        Message::EncryptedGradHess(gh) => gh,
        other => bail!("unexpected phase 1 response {}", other.kind()),
    };
    b.handle(1, &p1(b.name)?)?;

    let request = encode(Message::EncryptedGradHess(EncryptedGradHess {
        client: Some(b.name.to_string()),
        ..gh
    }))?;
    let data_list = match decode(&b.handle(2, &request)?)? {
        Message::P2Response(r) => r.feature_gl.into_iter().collect(),
        other => bail!("unexpected phase 2 response {}", other.kind()),
    };
    a.handle(2, &encode(Message::Empty)?)?;

    let request = encode(Message::P3Request(P3Request {
        client: a.name.to_string(),
        data_list,
    }))?;
    let best = match decode(&a.handle(3, &request)?)? {
        Message::P3Response(r) => r.best,
        other => bail!("unexpected phase 3 response {}", other.kind()),
    };
    b.handle(3, &encode(Message::Empty)?)?;

    let mut left = None;
    for party in [&mut *a, &mut *b] {
        let accept = best.as_ref().is_some_and(|c| c.client == party.name);
        let request = encode(Message::P4Request(P4Request {
            client: party.name.to_string(),
            feature: best.as_ref().map_or(0, |c| c.feature),
            split_index: best.as_ref().map_or(0, |c| c.split_index),
            accept,
        }))?;
        let response = party.handle(4, &request)?;
        if accept || (best.is_none() && party.name == "a") {
            left = Some(response);
        }
    }
    let left = left.context("no phase 4 owner")?;

    let finished = match decode(&a.handle(5, &left)?)? {
        Message::P5Response(r) => r.is_stop,
        other => bail!("unexpected phase 5 response {}", other.kind()),
    };
    b.handle(5, &encode(Message::Empty)?)?;
    Ok(finished)
}

#[test]
fn test_two_party_tree_over_json() -> Result<()> {
    let (mut a, mut b) = parties()?;
    assert_eq!(a.model.role(), Role::HasLabel);
    assert_eq!(b.model.role(), Role::NoLabel);

    let mut new_tree = true;
    let mut rounds = 0;
    while !node_round(&mut a, &mut b, new_tree)? {
        new_tree = false;
        rounds += 1;
        if rounds > 4 {
            bail!("tree did not finish");
        }
    }

    let tree = &a.model.trees()[0];
    let root = &tree[tree.root()];
    assert_eq!(root.client.as_deref(), Some("b"));
    assert_eq!(root.split_feature, Some(1));
    assert!(!root.is_leaf);
    assert_eq!(b.model.query_table().len(), 1);
    assert!(a.model.query_table().is_empty());
    assert_eq!(a.model.metrics().latest(MetricType::Auc), Some(1.0));
    Ok(())
}

#[test]
fn test_inference_over_json() -> Result<()> {
    let (mut a, mut b) = parties()?;
    let mut new_tree = true;
    while !node_round(&mut a, &mut b, new_tree)? {
        new_tree = false;
    }

    let requested = vec!["s01".to_string(), "s38".to_string()];
    let mut a_data = InferenceData::new(&a.raw, &a.features)?;
    let mut b_data = InferenceData::new(&b.raw, &b.features)?;

    let uids = encode(Message::Uids(requested))?;
    let trees = match decode(&encode(a.model.inference(-1, decode(&uids)?, &mut a_data)?)?)? {
        Message::InferenceTrees(trees) => trees,
        other => bail!("unexpected phase -1 response {}", other.kind()),
    };
    assert_eq!(b.model.inference(-1, decode(&uids)?, &mut b_data)?, Message::Empty);

    let tree = &trees.trees[0];
    let root = &tree[tree.root()];
    let queries: Vec<RoutingQuery> = (0..2)
        .map(|sample| RoutingQuery {
            sample,
            tree: 0,
            record_id: root.record_id,
        })
        .collect();
    let request = encode(Message::RoutingQueries(queries))?;
    let decisions = match decode(&encode(b.model.inference(-2, decode(&request)?, &mut b_data)?)?)? {
        Message::RoutingDecisions(d) => d,
        other => bail!("unexpected phase -2 response {}", other.kind()),
    };
    assert_eq!(decisions[0].direction, Direction::Left);
    assert_eq!(decisions[1].direction, Direction::Right);

    let leaf = |direction: Direction| -> Result<f64> {
        let id = match direction {
            Direction::Left => root.left,
            Direction::Right => root.right,
        }
        .context("root is a leaf")?;
        Ok(trees.first_round_pred + trees.eta * tree[id].leaf_score)
    };
    assert!(leaf(Direction::Left)? < leaf(Direction::Right)?);

    // The active party holds no query records
    let err = a
        .model
        .inference(-2, decode(&request)?, &mut a_data)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRecord { .. }));
    Ok(())
}

#[test]
fn test_wrong_message_for_phase_is_rejected() -> Result<()> {
    let (_, mut b) = parties()?;
    let request = encode(Message::P3Request(P3Request {
        client: "b".to_string(),
        data_list: Vec::new(),
    }))?;
    let err = b
        .model
        .train(2, decode(&request)?, &b.handle)
        .unwrap_err();
    assert!(matches!(err, Error::PhaseMismatch { phase: 2, .. }));
    Ok(())
}
