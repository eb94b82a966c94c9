#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ssc_signal_lib::{LoopbackFactory, Orchestrator, OrchestratorConfig, SignalingBus};

pub const TEACHER: &str = "teacher-1";

/// Учитель и его фабрика движков на общей шине
pub struct Classroom {
    pub bus: SignalingBus,
    pub teacher_engines: Arc<LoopbackFactory>,
    pub teacher: Orchestrator,
}

impl Classroom {
    pub fn new() -> Self {
        Self::with_teacher_engines(LoopbackFactory::new())
    }

    pub fn with_teacher_engines(engines: LoopbackFactory) -> Self {
        let bus = SignalingBus::new();
        let teacher_engines = Arc::new(engines);
        let teacher = Orchestrator::new(
            bus.clone(),
            teacher_engines.clone(),
            OrchestratorConfig::coordinator(TEACHER),
        )
        .expect("teacher config");
        Self {
            bus,
            teacher_engines,
            teacher,
        }
    }

    /// Ученик со своей фабрикой: движки сторон не смешиваются
    pub fn student(&self, id: &str) -> (Orchestrator, Arc<LoopbackFactory>) {
        self.student_with(id, LoopbackFactory::new())
    }

    pub fn student_with(
        &self,
        id: &str,
        engines: LoopbackFactory,
    ) -> (Orchestrator, Arc<LoopbackFactory>) {
        let engines = Arc::new(engines);
        let student = Orchestrator::new(
            self.bus.clone(),
            engines.clone(),
            OrchestratorConfig::subordinate(id, TEACHER),
        )
        .expect("student config");
        (student, engines)
    }
}

/// Ждёт условие, уступая рантайму; около двух секунд максимум
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
