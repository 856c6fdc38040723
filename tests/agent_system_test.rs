#[cfg(test)]
mod agent_system_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use fitbus::{
        Agent, AgentCore, AgentDefinition, AgentError, AgentManager, AgentResponse, BusConfig,
        Error, ManagerConfig, ManagerState, Message, MessageBus, MessageType, SYSTEM_SENDER,
        StateMap,
        agents::{self, NAVIGATION_AGENT, SETTINGS_AGENT},
    };

    /// Configurable test agent: records everything it receives, can be told
    /// to fail on a message type, to answer slowly, or to fail its destroy.
    #[derive(Default)]
    struct ProbeConfig {
        name: String,
        dependencies: Vec<String>,
        fail_on: Option<MessageType>,
        delay: Option<Duration>,
        destroy_log: Option<Arc<Mutex<Vec<String>>>>,
        fail_destroy: bool,
    }

    struct ProbeAgent {
        core: AgentCore,
        received: Arc<Mutex<Vec<Message>>>,
        config: ProbeConfig,
    }

    impl ProbeAgent {
        async fn spawn(bus: Arc<MessageBus>, config: ProbeConfig) -> fitbus::Result<Arc<Self>> {
            let agent = Arc::new(Self {
                core: AgentCore::new(
                    config.name.clone(),
                    "1.0.0",
                    config.dependencies.clone(),
                    Arc::clone(&bus),
                    StateMap::new(),
                ),
                received: Arc::new(Mutex::new(Vec::new())),
                config,
            });
            bus.register_agent(agent.clone() as Arc<dyn Agent>).await?;
            Ok(agent)
        }

        async fn received_count(&self, message_type: &MessageType) -> usize {
            self.received
                .lock()
                .await
                .iter()
                .filter(|m| &m.message_type == message_type)
                .count()
        }
    }

    #[async_trait]
    impl Agent for ProbeAgent {
        fn core(&self) -> &AgentCore {
            &self.core
        }

        async fn initialize(&self) -> fitbus::Result<()> {
            if !self.core.begin_initialize().await? {
                return Ok(());
            }
            self.core.finish_initialize().await
        }

        async fn handle_message(&self, message: &Message) -> fitbus::Result<AgentResponse> {
            self.received.lock().await.push(message.clone());

            if let Some(delay) = self.config.delay {
                tokio::time::sleep(delay).await;
            }
            if self.config.fail_on.as_ref() == Some(&message.message_type) {
                return Err(AgentError::InvalidPayload("induced failure".to_string()).into());
            }

            match &message.message_type {
                MessageType::HealthCheck => Ok(self.core.health_response(message)),
                MessageType::Custom(tag) if tag == "ping" => Ok(AgentResponse::ok(
                    json!({ "pong": true }),
                    message.correlation_id.clone(),
                )),
                _ => Ok(AgentResponse::ok(
                    json!({ "ack": true }),
                    message.correlation_id.clone(),
                )),
            }
        }

        async fn destroy(&self) -> fitbus::Result<()> {
            if let Some(log) = &self.config.destroy_log {
                log.lock().await.push(self.core.name().to_string());
            }
            if self.config.fail_destroy {
                // Misbehave: refuse to tear down, leaving the registry
                // entry in place.
                return Err(AgentError::ShutdownError {
                    agent: self.core.name().to_string(),
                    reason: "induced destroy failure".to_string(),
                }
                .into());
            }
            self.core.teardown().await
        }
    }

    fn probe(name: &str) -> ProbeConfig {
        ProbeConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn probe_definition(
        name: &'static str,
        log: Option<Arc<Mutex<Vec<String>>>>,
        fail_destroy: bool,
    ) -> AgentDefinition {
        AgentDefinition::new(name, move |bus| {
            let log = log.clone();
            async move {
                let agent: Arc<dyn Agent> = ProbeAgent::spawn(
                    bus,
                    ProbeConfig {
                        name: name.to_string(),
                        destroy_log: log,
                        fail_destroy,
                        ..Default::default()
                    },
                )
                .await?;
                Ok(agent)
            }
        })
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met within 2s");
    }

    #[tokio::test]
    async fn test_registration_uniqueness() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let first = ProbeAgent::spawn(Arc::clone(&bus), probe("duplicate")).await.unwrap();

        let second = ProbeAgent::spawn(Arc::clone(&bus), probe("duplicate")).await;
        assert!(matches!(
            second,
            Err(Error::AgentError(AgentError::DuplicateAgent(_)))
        ));

        // The registry retains the first instance: traffic reaches it.
        assert_eq!(bus.registered_agents().await, vec!["duplicate".to_string()]);
        bus.send(Message::new(
            SYSTEM_SENDER,
            Some("duplicate"),
            MessageType::Custom("ping".to_string()),
            json!({}),
        ))
        .await
        .unwrap();
        assert_eq!(
            first
                .received_count(&MessageType::Custom("ping".to_string()))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));

        // Dependency not registered at all.
        let orphan = ProbeAgent::spawn(
            Arc::clone(&bus),
            ProbeConfig {
                name: "orphan".to_string(),
                dependencies: vec!["ghost".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let result = orphan.initialize().await;
        assert!(matches!(
            result,
            Err(Error::AgentError(AgentError::MissingDependency { .. }))
        ));
        assert!(!orphan.is_initialized());

        // Dependency registered but not yet initialized: still gated.
        let _dep = ProbeAgent::spawn(Arc::clone(&bus), probe("dep")).await.unwrap();
        let eager = ProbeAgent::spawn(
            Arc::clone(&bus),
            ProbeConfig {
                name: "eager".to_string(),
                dependencies: vec!["dep".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let result = eager.initialize().await;
        assert!(matches!(
            result,
            Err(Error::AgentError(AgentError::DependencyNotReady { .. }))
        ));
        assert!(!eager.is_initialized());
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let fragile = ProbeAgent::spawn(
            Arc::clone(&bus),
            ProbeConfig {
                name: "fragile".to_string(),
                fail_on: Some(MessageType::Custom("explode".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let caller = ProbeAgent::spawn(Arc::clone(&bus), probe("caller")).await.unwrap();

        let result = bus
            .send(Message::new(
                "caller",
                Some("fragile"),
                MessageType::Custom("explode".to_string()),
                json!({}),
            ))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());

        // Caller and bus are unaffected.
        assert!(bus.is_agent_registered("caller").await);
        let ok = bus
            .send(Message::new(
                "fragile",
                Some("caller"),
                MessageType::Custom("ping".to_string()),
                json!({}),
            ))
            .await
            .unwrap();
        assert!(ok.success);
        drop((fragile, caller));
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_and_double_delivery() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let sender = ProbeAgent::spawn(Arc::clone(&bus), probe("sender")).await.unwrap();
        let plain = ProbeAgent::spawn(Arc::clone(&bus), probe("plain")).await.unwrap();
        let subscriber = ProbeAgent::spawn(Arc::clone(&bus), probe("subscriber")).await.unwrap();

        let team_update = MessageType::Custom("team.update".to_string());
        let extra_hits = Arc::new(Mutex::new(0u32));
        {
            use futures::FutureExt;
            let extra_hits = Arc::clone(&extra_hits);
            bus.subscribe("subscriber", team_update.clone(), move |message| {
                let extra_hits = Arc::clone(&extra_hits);
                async move {
                    *extra_hits.lock().await += 1;
                    Ok(AgentResponse::ok(json!({}), message.correlation_id))
                }
                .boxed()
            })
            .await
            .unwrap();
        }

        let deliveries = bus
            .broadcast(Message::broadcast("sender", team_update.clone(), json!({})))
            .await
            .unwrap();

        // Two handle_message deliveries plus one subscription delivery.
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| d.success));
        assert_eq!(plain.received_count(&team_update).await, 1);
        assert_eq!(subscriber.received_count(&team_update).await, 1);
        assert_eq!(*extra_hits.lock().await, 1);
        // The sender never observes its own broadcast on either path.
        assert_eq!(sender.received_count(&team_update).await, 0);
    }

    #[tokio::test]
    async fn test_sender_subscription_excluded_from_own_broadcast() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let _sender = ProbeAgent::spawn(Arc::clone(&bus), probe("sender")).await.unwrap();
        let _other = ProbeAgent::spawn(Arc::clone(&bus), probe("other")).await.unwrap();

        let tag = MessageType::Custom("team.update".to_string());
        let own_hits = Arc::new(Mutex::new(0u32));
        {
            use futures::FutureExt;
            let own_hits = Arc::clone(&own_hits);
            bus.subscribe("sender", tag.clone(), move |message| {
                let own_hits = Arc::clone(&own_hits);
                async move {
                    *own_hits.lock().await += 1;
                    Ok(AgentResponse::ok(json!({}), message.correlation_id))
                }
                .boxed()
            })
            .await
            .unwrap();
        }

        let deliveries = bus
            .broadcast(Message::broadcast("sender", tag, json!({})))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1); // only "other"
        assert_eq!(*own_hits.lock().await, 0);
    }

    #[tokio::test]
    async fn test_history_boundedness() {
        let bus = Arc::new(MessageBus::new(BusConfig {
            history_capacity: 1000,
            ..Default::default()
        }));
        let _a = ProbeAgent::spawn(Arc::clone(&bus), probe("a")).await.unwrap();
        let _b = ProbeAgent::spawn(Arc::clone(&bus), probe("b")).await.unwrap();

        for i in 0..1500u32 {
            bus.send(Message::new(
                "a",
                Some("b"),
                MessageType::Custom("tick".to_string()),
                json!({ "seq": i }),
            ))
            .await
            .unwrap();
        }

        let history = bus.get_history(None).await;
        assert_eq!(history.len(), 1000);
        // The 1000 most recent survive.
        assert_eq!(history[0].payload, json!({ "seq": 500 }));
        assert_eq!(history[999].payload, json!({ "seq": 1499 }));
    }

    #[tokio::test]
    async fn test_round_trip_correlation() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let _target = ProbeAgent::spawn(Arc::clone(&bus), probe("target")).await.unwrap();

        let request = Message::new(
            SYSTEM_SENDER,
            Some("target"),
            MessageType::Custom("ping".to_string()),
            json!({}),
        );
        let correlation_id = request.correlation_id.clone();

        let response = bus.send(request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data, Some(json!({ "pong": true })));
        assert_eq!(response.correlation_id, correlation_id);
    }

    #[tokio::test]
    async fn test_manager_rejects_operations_before_ready() {
        let manager = AgentManager::new(ManagerConfig::default());

        let result = manager
            .send_message("anyone", MessageType::SettingsGet, json!({}))
            .await;
        assert!(matches!(
            result,
            Err(Error::AgentError(AgentError::NotReady(_)))
        ));

        let result = manager.restart_agent("anyone").await;
        assert!(matches!(
            result,
            Err(Error::AgentError(AgentError::NotReady(_)))
        ));
    }

    #[tokio::test]
    async fn test_manager_initializes_roster_in_dependency_order() {
        fitbus::telemetry::init();

        // The roster deliberately declares the feed agent first; the
        // computed order must still bring settings up before its
        // dependents.
        let mut manager = AgentManager::new(ManagerConfig::default());
        for definition in agents::default_definitions() {
            manager = manager.with_agent(definition);
        }

        manager.initialize().await.unwrap();
        assert_eq!(manager.state().await, ManagerState::Ready);

        for name in [SETTINGS_AGENT, NAVIGATION_AGENT, "social-feed"] {
            let agent = manager.agent(name).await.expect("agent running");
            assert!(agent.is_initialized());
        }

        // Idempotent: a second initialize is a no-op.
        manager.initialize().await.unwrap();

        // End-to-end traffic through the manager.
        let response = manager
            .send_message(
                NAVIGATION_AGENT,
                MessageType::NavigateTo,
                json!({ "route": "/workouts" }),
            )
            .await
            .unwrap();
        assert!(response.success);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_aborts_on_construction_failure() {
        let manager = AgentManager::new(ManagerConfig::default())
            .with_agent(probe_definition("early", None, false))
            .with_agent(AgentDefinition::new("broken", |_bus| async move {
                let err: Error =
                    AgentError::InvalidPayload("construction failed".to_string()).into();
                Err::<Arc<dyn Agent>, Error>(err)
            }));

        let result = manager.initialize().await;
        assert!(result.is_err());
        assert_eq!(manager.state().await, ManagerState::Uninitialized);
        // The partially-constructed system is torn down.
        assert!(manager.bus().registered_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_discards_state() {
        let mut manager = AgentManager::new(ManagerConfig::default());
        for definition in agents::default_definitions() {
            manager = manager.with_agent(definition);
        }
        manager.initialize().await.unwrap();

        manager
            .send_message(
                NAVIGATION_AGENT,
                MessageType::NavigateTo,
                json!({ "route": "/teams" }),
            )
            .await
            .unwrap();
        let before = manager.agent(NAVIGATION_AGENT).await.unwrap();
        before
            .core()
            .set_state(StateMap::from([("scratch".to_string(), json!(42))]))
            .await;
        assert_eq!(
            before.core().state_value("current_route").await,
            Some(json!("/teams"))
        );

        manager.restart_agent(NAVIGATION_AGENT).await.unwrap();

        let after = manager.agent(NAVIGATION_AGENT).await.unwrap();
        assert!(after.is_initialized());
        assert_eq!(
            after.core().state_value("current_route").await,
            Some(json!("/"))
        );
        assert_eq!(after.core().state_value("scratch").await, None);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_reverse_order_and_tolerance() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = AgentManager::new(ManagerConfig::default())
            .with_agent(probe_definition("a", Some(Arc::clone(&log)), false))
            .with_agent(probe_definition("b", Some(Arc::clone(&log)), true))
            .with_agent(probe_definition("c", Some(Arc::clone(&log)), false));

        manager.initialize().await.unwrap();

        manager.shutdown().await.unwrap();

        // Reverse of the computed startup order [a, b, c], and b's destroy
        // failure does not block a or c.
        assert_eq!(*log.lock().await, vec!["c", "b", "a"]);
        assert_eq!(manager.state().await, ManagerState::Uninitialized);
        assert!(manager.bus().registered_agents().await.is_empty());
        assert!(manager.bus().get_history(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_flags_slow_agent_without_restarting() {
        let manager = AgentManager::new(ManagerConfig {
            health_check_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .with_agent(probe_definition("fast", None, false))
        .with_agent(AgentDefinition::new("slow", |bus| async move {
            let agent: Arc<dyn Agent> = ProbeAgent::spawn(
                bus,
                ProbeConfig {
                    name: "slow".to_string(),
                    delay: Some(Duration::from_millis(400)),
                    ..Default::default()
                },
            )
            .await?;
            Ok(agent)
        }));

        manager.initialize().await.unwrap();

        let unhealthy = manager.perform_health_check().await.unwrap();
        assert_eq!(unhealthy, vec!["slow".to_string()]);

        // Detection never restarts: the slow agent is still registered.
        assert!(manager.bus().is_agent_registered("slow").await);
        // The warning names the unhealthy set and reaches healthy agents.
        let history = manager
            .bus()
            .get_history(Some(
                fitbus::HistoryFilter::new().with_type(MessageType::HealthWarning),
            ))
            .await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload, json!({ "unhealthy": ["slow"] }));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_broadcasts_and_fault_monitor() {
        let manager = AgentManager::new(ManagerConfig::default())
            .with_agent(probe_definition("listener", None, false));

        manager.initialize().await.unwrap();
        let bus = manager.bus();

        // Startup was announced.
        let announced = bus
            .get_history(Some(
                fitbus::HistoryFilter::new().with_type(MessageType::SystemReady),
            ))
            .await;
        assert_eq!(announced.len(), 1);

        // A reported fault comes back as a system error broadcast.
        manager
            .fault_sink()
            .await
            .report("integration-test", "simulated background failure");
        let history_bus = Arc::clone(&bus);
        wait_until(move || {
            let bus = Arc::clone(&history_bus);
            async move {
                !bus.get_history(Some(
                    fitbus::HistoryFilter::new().with_type(MessageType::SystemError),
                ))
                .await
                .is_empty()
            }
        })
        .await;

        // The shutdown notice goes out before agents are destroyed.
        let mut events = bus.subscribe_events();
        manager.shutdown().await.unwrap();
        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            if let fitbus::BusEvent::MessageBroadcast { message } = event {
                if message.message_type == MessageType::SystemShutdown {
                    saw_notice = true;
                }
            }
        }
        assert!(saw_notice);
        assert_eq!(manager.state().await, ManagerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_bus_events_are_observable() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let mut events = bus.subscribe_events();

        let _agent = ProbeAgent::spawn(Arc::clone(&bus), probe("watched")).await.unwrap();

        match events.recv().await.unwrap() {
            fitbus::BusEvent::AgentRegistered { name } => assert_eq!(name, "watched"),
            other => panic!("unexpected event: {other:?}"),
        }

        bus.send(Message::new(
            SYSTEM_SENDER,
            Some("watched"),
            MessageType::Custom("ping".to_string()),
            json!({}),
        ))
        .await
        .unwrap();

        match events.recv().await.unwrap() {
            fitbus::BusEvent::MessageSent { message } => {
                assert_eq!(message.to.as_deref(), Some("watched"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_handlers_fire_in_registration_order() {
        use futures::FutureExt;

        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let _sender = ProbeAgent::spawn(Arc::clone(&bus), probe("sender")).await.unwrap();
        let _listener = ProbeAgent::spawn(Arc::clone(&bus), probe("listener")).await.unwrap();

        let tag = MessageType::Custom("music.play".to_string());
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let order = Arc::clone(&order);
            bus.subscribe("listener", tag.clone(), move |message| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().await.push(label);
                    Ok(AgentResponse::ok(json!({}), message.correlation_id))
                }
                .boxed()
            })
            .await
            .unwrap();
        }

        bus.broadcast(Message::broadcast("sender", tag, json!({})))
            .await
            .unwrap();
        assert_eq!(*order.lock().await, vec!["first", "second"]);
    }
}
