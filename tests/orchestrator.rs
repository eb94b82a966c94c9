mod support;

use std::sync::Arc;
use std::time::Duration;

use ssc_signal_lib::peer::types::{
    ConnectivityState, SessionDescription, TransportState, TransportStatus,
};
use ssc_signal_lib::signaling::SignalMessage;
use ssc_signal_lib::{
    LoopbackFactory, NegotiationState, Orchestrator, OrchestratorConfig, PeerId, Role,
    SessionError, Signal,
};
use support::{eventually, settle, Classroom, TEACHER};

fn teacher_id() -> PeerId {
    PeerId::new(TEACHER)
}

fn slow_engines() -> LoopbackFactory {
    LoopbackFactory::new().with_create_delay(Duration::from_millis(100))
}

#[tokio::test]
async fn student_connects_to_serving_teacher() {
    let classroom = Classroom::new();
    let (student, _) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");

    student.connect(&teacher_id()).await.expect("connect");

    assert!(eventually(|| student.get_state().is_connected).await);
    assert!(
        eventually(|| {
            classroom
                .teacher
                .get_state()
                .active_sessions
                .iter()
                .any(|s| s.session_id == PeerId::new("peer-A"))
        })
        .await
    );

    let local = student.get_state().local_session_info.expect("local session");
    assert_eq!(local.role, Role::Subordinate);
    assert_eq!(local.negotiation_state, NegotiationState::Connected);
    assert!(local.connected_at.is_some());

    let remote = &classroom.teacher.get_state().active_sessions[0];
    assert_eq!(remote.role, Role::Coordinator);
    assert_eq!(remote.connectivity_state, ConnectivityState::Connected);
}

#[tokio::test]
async fn stopping_the_server_disconnects_students() {
    let classroom = Classroom::new();
    let (student, engines) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| student.get_state().is_connected).await);

    classroom.teacher.stop_serving().await.expect("stop");

    assert!(eventually(|| student.get_state().local_session_info.is_none()).await);
    let state = student.get_state();
    assert!(!state.is_connected);
    assert!(state.last_rejection.is_none());
    assert!(engines.last(&"peer-A".into()).expect("engine").is_closed());

    let teacher = classroom.teacher.get_state();
    assert!(!teacher.is_serving);
    assert!(teacher.active_sessions.is_empty());
    assert!(classroom.teacher.list_sessions().is_empty());

    // повторная остановка ничего не ломает
    classroom.teacher.stop_serving().await.expect("stop again");
}

#[tokio::test]
async fn teacher_serves_several_students() {
    let classroom = Classroom::new();
    classroom.teacher.start_serving().await.expect("start");
    let mut students = Vec::new();
    for id in ["peer-C", "peer-A", "peer-B"] {
        let (student, _) = classroom.student(id);
        student.connect(&teacher_id()).await.expect("connect");
        students.push(student);
    }

    assert!(eventually(|| classroom.teacher.get_state().active_sessions.len() == 3).await);
    assert!(eventually(|| students.iter().all(|s| s.get_state().is_connected)).await);

    let ids: Vec<String> = classroom
        .teacher
        .get_state()
        .active_sessions
        .iter()
        .map(|s| s.session_id.to_string())
        .collect();
    assert_eq!(ids, ["peer-A", "peer-B", "peer-C"]);

    assert!(classroom
        .teacher
        .close_session(&"peer-B".into())
        .await
        .expect("close"));
    assert_eq!(classroom.teacher.list_sessions().len(), 2);
}

#[tokio::test]
async fn offer_before_start_is_rejected_with_reason() {
    let classroom = Classroom::new();
    let (student, engines) = classroom.student("peer-A");

    student.connect(&teacher_id()).await.expect("offer sent");

    assert!(
        eventually(|| student.get_state().last_rejection.as_deref() == Some("server not started"))
            .await
    );
    assert!(eventually(|| student.get_state().local_session_info.is_none()).await);
    assert!(engines.last(&"peer-A".into()).expect("engine").is_closed());
    assert!(classroom.teacher.list_sessions().is_empty());

    // после старта та же попытка проходит, а причина отказа сбрасывается
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| student.get_state().is_connected).await);
    assert!(student.get_state().last_rejection.is_none());
}

#[tokio::test]
async fn stray_answer_is_ignored_by_connected_student() {
    let classroom = Classroom::new();
    let (student, engines) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| student.get_state().is_connected).await);

    classroom.bus.send_signal(
        &teacher_id(),
        &"peer-A".into(),
        &Signal::Answer(SessionDescription::answer("v=0 stray")),
    );
    settle().await;

    assert!(student.get_state().is_connected);
    let engine = engines.last(&"peer-A".into()).expect("engine");
    assert_ne!(
        engine.remote_description().map(|d| d.sdp),
        Some("v=0 stray".to_string())
    );
}

#[tokio::test]
async fn operations_respect_enabled_roles() {
    let classroom = Classroom::new();
    let (student, _) = classroom.student("peer-A");

    assert!(matches!(
        student.start_serving().await,
        Err(SessionError::RoleNotEnabled(Role::Coordinator))
    ));
    assert!(matches!(
        classroom.teacher.connect(&teacher_id()).await,
        Err(SessionError::RoleNotEnabled(Role::Subordinate))
    ));
    assert!(matches!(student.local_session(), Err(SessionError::NoSession)));

    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("connect");
    assert!(matches!(
        student.connect(&teacher_id()).await,
        Err(SessionError::AlreadyActive)
    ));
}

#[tokio::test]
async fn students_hear_the_start_announcement() {
    let classroom = Classroom::new();
    let (student, _) = classroom.student("peer-A");

    classroom.teacher.start_serving().await.expect("start");
    classroom.teacher.start_serving().await.expect("idempotent");

    assert!(eventually(|| student.server_notice().as_deref() == Some("server started")).await);
    assert!(classroom.teacher.get_state().is_serving);
}

#[tokio::test]
async fn garbage_on_the_bus_does_not_break_the_teacher() {
    let classroom = Classroom::new();
    let (student, _) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");

    let from = PeerId::new("peer-A");
    for action in ["offer", "candidate", "mystery"] {
        classroom.bus.send(
            &from,
            &teacher_id(),
            SignalMessage {
                action: action.into(),
                payload: None,
            },
        );
    }
    settle().await;
    assert!(classroom.teacher.list_sessions().is_empty());

    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| student.get_state().is_connected).await);
}

#[tokio::test]
async fn failed_teacher_sessions_are_reaped_on_refresh() {
    let classroom = Classroom::new();
    let (student, _) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| classroom.teacher.get_state().active_sessions.len() == 1).await);

    let engine = classroom
        .teacher_engines
        .last(&"peer-A".into())
        .expect("teacher engine");
    engine.fail_transport();
    settle().await;
    classroom.teacher.refresh().await;

    assert!(classroom.teacher.list_sessions().is_empty());
    assert!(engine.is_closed());
}

#[tokio::test]
async fn refresh_loop_catches_silent_failures() {
    let classroom = Classroom::new();
    let engines = Arc::new(LoopbackFactory::new());
    let teacher = Orchestrator::new(
        classroom.bus.clone(),
        engines.clone(),
        OrchestratorConfig {
            refresh_interval_ms: 20,
            ..OrchestratorConfig::coordinator("teacher-2")
        },
    )
    .expect("config");
    let student = Orchestrator::new(
        classroom.bus.clone(),
        Arc::new(LoopbackFactory::new()),
        OrchestratorConfig::subordinate("peer-A", "teacher-2"),
    )
    .expect("config");
    teacher.start_serving().await.expect("start");
    teacher.spawn_refresh_loop();
    student.connect(&"teacher-2".into()).await.expect("connect");
    assert!(eventually(|| teacher.get_state().active_sessions.len() == 1).await);

    engines
        .last(&"peer-A".into())
        .expect("engine")
        .set_status_silently(TransportStatus {
            connection: TransportState::Failed,
            connectivity: ConnectivityState::Failed,
            data_channel: None,
        });

    assert!(eventually(|| teacher.list_sessions().is_empty()).await);
    teacher.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_the_bus_and_the_students() {
    let classroom = Classroom::new();
    let (student, _) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| student.get_state().is_connected).await);

    classroom.teacher.shutdown().await;

    assert!(!classroom.bus.is_registered(&teacher_id()));
    assert!(eventually(|| student.get_state().local_session_info.is_none()).await);

    student.shutdown().await;
    assert!(!classroom.bus.is_registered(&"peer-A".into()));
}

#[tokio::test]
async fn stop_serving_while_the_teacher_engine_is_created() {
    let classroom = Classroom::with_teacher_engines(slow_engines());
    let (student, _) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("offer sent");
    tokio::time::sleep(Duration::from_millis(30)).await;

    classroom.teacher.stop_serving().await.expect("stop");

    assert!(
        eventually(|| {
            classroom
                .teacher_engines
                .last(&"peer-A".into())
                .is_some_and(|engine| engine.is_closed())
        })
        .await
    );
    settle().await;
    let teacher = classroom.teacher.get_state();
    assert!(!teacher.is_serving);
    assert!(teacher.active_sessions.is_empty());
    assert!(classroom.teacher.list_sessions().is_empty());
    assert!(eventually(|| student.get_state().local_session_info.is_none()).await);
}

#[tokio::test]
async fn close_session_while_the_teacher_engine_is_created() {
    let classroom = Classroom::with_teacher_engines(slow_engines());
    let (student, _) = classroom.student("peer-A");
    classroom.teacher.start_serving().await.expect("start");
    student.connect(&teacher_id()).await.expect("offer sent");
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(classroom
        .teacher
        .close_session(&"peer-A".into())
        .await
        .expect("close"));

    assert!(
        eventually(|| {
            classroom
                .teacher_engines
                .last(&"peer-A".into())
                .is_some_and(|engine| engine.is_closed())
        })
        .await
    );
    settle().await;
    assert!(classroom.teacher.list_sessions().is_empty());
    assert!(classroom.teacher.get_state().is_serving);
}

#[tokio::test]
async fn disconnect_while_the_student_engine_is_created() {
    let classroom = Classroom::new();
    let (student, engines) = classroom.student_with("peer-A", slow_engines());
    classroom.teacher.start_serving().await.expect("start");
    let student = Arc::new(student);
    let connecting = {
        let student = student.clone();
        tokio::spawn(async move { student.connect(&teacher_id()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        student.connect(&teacher_id()).await,
        Err(SessionError::AlreadyActive)
    ));
    student.disconnect().await.expect("disconnect");

    let result = connecting.await.expect("join");
    assert!(matches!(result, Err(SessionError::NoSession)));
    assert!(student.get_state().local_session_info.is_none());
    assert!(engines.last(&"peer-A".into()).expect("engine").is_closed());
    settle().await;
    assert!(classroom.teacher.list_sessions().is_empty());

    // отменённая попытка не мешает следующей
    student.connect(&teacher_id()).await.expect("connect");
    assert!(eventually(|| student.get_state().is_connected).await);
}
