use lw_core::{
    AppliedTable, Backend, BackendError, DirectEngine, ErrorKind, Family, MemoryBackend, Rule,
    TableState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records like `MemoryBackend` but can be told to fail
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
}

impl FlakyBackend {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::exit(
                "iptables-restore",
                Some(1),
                "iptables-restore: line 3 failed",
            ));
        }
        Ok(())
    }

    async fn last(&self, family: Family, table: &str) -> Option<AppliedTable> {
        self.inner.last_applied(family, table).await
    }
}

impl Backend for FlakyBackend {
    async fn apply(
        &self,
        family: Family,
        table: &str,
        state: &TableState,
    ) -> Result<(), BackendError> {
        self.check()?;
        self.inner.apply(family, table, state).await
    }

    async fn run(&self, family: Family, args: &[String]) -> Result<String, BackendError> {
        self.check()?;
        self.inner.run(family, args).await?;
        Ok(format!("ran {}", args.join(" ")))
    }
}

fn args(spec: &str) -> Vec<String> {
    spec.split_whitespace().map(str::to_string).collect()
}

async fn engine_with_foo1() -> DirectEngine<FlakyBackend> {
    let engine = DirectEngine::new(FlakyBackend::default());
    engine
        .add_chain(Family::Ipv4, "filter", "direct_foo1")
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn add_remove_chain() {
    let engine = engine_with_foo1().await;

    engine.add_chain(Family::Ipv4, "filter", "direct_foo2").await.unwrap();
    let err = engine
        .add_chain(Family::Ipv4, "filter", "direct_foo2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);
    assert_eq!(
        engine.get_chains(Family::Ipv4, "filter").await,
        vec!["direct_foo1", "direct_foo2"]
    );
    assert!(engine.query_chain(Family::Ipv4, "filter", "direct_foo2").await);

    engine.remove_chain(Family::Ipv4, "filter", "direct_foo2").await.unwrap();
    let err = engine
        .remove_chain(Family::Ipv4, "filter", "direct_foo2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEnabled);
    assert_eq!(engine.get_chains(Family::Ipv4, "filter").await, vec!["direct_foo1"]);
    assert!(!engine.query_chain(Family::Ipv4, "filter", "direct_foo2").await);
}

#[tokio::test]
async fn add_remove_rule() {
    let engine = engine_with_foo1().await;
    let rules = [
        (0, "-m tcp -p tcp --dport 332 -j ACCEPT"),
        (0, "-m tcp -p tcp --dport 333 -j ACCEPT"),
        (1, "-m tcp -p tcp --dport 334 -j ACCEPT"),
        (-5, "-m tcp -p tcp --dport 331 -j ACCEPT"),
        (-10, "-m tcp -p tcp --dport 330 -j ACCEPT"),
        (-5, "-m udp -p udp --dport 331 -j ACCEPT"),
    ];
    for (priority, spec) in rules {
        engine
            .add_rule(Family::Ipv4, "filter", "direct_foo1", priority, &args(spec))
            .await
            .unwrap();
    }

    let dup = args("-m udp -p udp --dport 331 -j ACCEPT");
    let err = engine
        .add_rule(Family::Ipv4, "filter", "direct_foo1", -5, &dup)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);
    assert!(engine.query_rule(Family::Ipv4, "filter", "direct_foo1", -5, &dup).await);

    let listed = engine.get_rules(Family::Ipv4, "filter", "direct_foo1").await;
    let expected: Vec<Rule> = [
        (-10, "-m tcp -p tcp --dport 330 -j ACCEPT"),
        (-5, "-m tcp -p tcp --dport 331 -j ACCEPT"),
        (-5, "-m udp -p udp --dport 331 -j ACCEPT"),
        (0, "-m tcp -p tcp --dport 332 -j ACCEPT"),
        (0, "-m tcp -p tcp --dport 333 -j ACCEPT"),
        (1, "-m tcp -p tcp --dport 334 -j ACCEPT"),
    ]
    .into_iter()
    .map(|(priority, spec)| Rule::new(priority, args(spec)))
    .collect();
    assert_eq!(listed, expected);

    // The backend sees the same order
    let applied = engine.backend().last(Family::Ipv4, "filter").await.unwrap();
    assert_eq!(applied.rules, vec![("direct_foo1".to_string(), expected.clone())]);

    for rule in &expected {
        engine
            .remove_rule(Family::Ipv4, "filter", "direct_foo1", rule.priority, &rule.args)
            .await
            .unwrap();
    }
    let last = args("-m tcp -p tcp --dport 334 -j ACCEPT");
    let err = engine
        .remove_rule(Family::Ipv4, "filter", "direct_foo1", 1, &last)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEnabled);
    assert!(!engine.query_rule(Family::Ipv4, "filter", "direct_foo1", 1, &last).await);
    assert!(engine.get_rules(Family::Ipv4, "filter", "direct_foo1").await.is_empty());
}

#[tokio::test]
async fn rules_need_no_explicit_chain() {
    let engine = DirectEngine::new(FlakyBackend::default());
    engine
        .add_rule(Family::Ipv6, "filter", "INPUT", 0, &args("-j ACCEPT"))
        .await
        .unwrap();
    assert!(engine.get_chains(Family::Ipv6, "filter").await.is_empty());
    assert_eq!(engine.get_rules(Family::Ipv6, "filter", "INPUT").await.len(), 1);
}

#[tokio::test]
async fn cascade_delete_on_remove_chain() {
    let engine = engine_with_foo1().await;
    engine
        .add_rule(Family::Ipv4, "filter", "direct_foo1", 0, &args("-j ACCEPT"))
        .await
        .unwrap();

    engine.remove_chain(Family::Ipv4, "filter", "direct_foo1").await.unwrap();

    assert!(engine.get_rules(Family::Ipv4, "filter", "direct_foo1").await.is_empty());
    assert!(
        !engine
            .query_rule(Family::Ipv4, "filter", "direct_foo1", 0, &args("-j ACCEPT"))
            .await
    );
    let applied = engine.backend().last(Family::Ipv4, "filter").await.unwrap();
    assert!(applied.chains.is_empty());
    assert!(applied.rules.is_empty());
}

#[tokio::test]
async fn backend_failure_keeps_mutation() {
    let engine = engine_with_foo1().await;
    engine.backend().set_failing(true);

    let err = engine
        .add_chain(Family::Ipv4, "filter", "direct_foo2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendError);
    assert!(engine.query_chain(Family::Ipv4, "filter", "direct_foo2").await);

    // Retrying the add is now a rejected mutation, not a backend failure
    let err = engine
        .add_chain(Family::Ipv4, "filter", "direct_foo2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);

    assert_eq!(
        engine.reload().await.unwrap_err().kind(),
        ErrorKind::BackendError
    );

    engine.backend().set_failing(false);
    engine.reload().await.unwrap();
    let applied = engine.backend().last(Family::Ipv4, "filter").await.unwrap();
    assert_eq!(applied.chains, vec!["direct_foo1", "direct_foo2"]);
}

#[tokio::test]
async fn passthrough_returns_output_and_stays_untracked() {
    let engine = engine_with_foo1().await;

    let output = engine
        .passthrough(Family::Ipv4, &args("-t filter -N foobar"))
        .await
        .unwrap();
    assert_eq!(output, "ran -t filter -N foobar");
    assert_eq!(engine.get_chains(Family::Ipv4, "filter").await, vec!["direct_foo1"]);

    // Not tracked, so repeating it is not ALREADY_ENABLED
    engine
        .passthrough(Family::Ipv4, &args("-t filter -N foobar"))
        .await
        .unwrap();

    engine.backend().set_failing(true);
    let err = engine
        .passthrough(Family::Ipv4, &args("-t filter -L"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendError);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_adds_succeed_once() {
    let engine = Arc::new(DirectEngine::new(MemoryBackend::new()));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .add_rule(Family::Ipv4, "filter", "INPUT", 0, &args("-j ACCEPT"))
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::AlreadyEnabled),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(engine.get_rules(Family::Ipv4, "filter", "INPUT").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_removes_succeed_once() {
    let engine = Arc::new(DirectEngine::new(MemoryBackend::new()));
    engine.add_chain(Family::Ipv4, "filter", "X").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.remove_chain(Family::Ipv4, "filter", "X").await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}
