use crate::error::Fault;
use crate::register::{RegisterKey, RegisterSpace, RegisterValue, WriteRequest};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-memory device with fault injection.
///
/// Both register spaces map onto one bank, so a written holding register is
/// visible to an input-register poll as well.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

#[derive(Debug)]
struct DeviceState {
    registers: HashMap<RegisterKey, RegisterValue>,
    reachable: bool,
    connect_hangs: bool,
    failing_reads: HashSet<RegisterKey>,
    hanging_reads: HashSet<RegisterKey>,
    reject_writes: bool,
    read_latency: Duration,
    connects: u64,
    closes: u64,
    reads: u64,
    active: u32,
    peak_active: u32,
    writes: Vec<WriteRequest>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            registers: HashMap::new(),
            reachable: true,
            connect_hangs: false,
            failing_reads: HashSet::new(),
            hanging_reads: HashSet::new(),
            reject_writes: false,
            read_latency: Duration::ZERO,
            connects: 0,
            closes: 0,
            reads: 0,
            active: 0,
            peak_active: 0,
            writes: Vec::new(),
        }
    }
}

enum ReadPlan {
    Hang,
    Fail,
    Value(Option<RegisterValue>),
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
        }
    }

    pub fn with_registers(values: impl IntoIterator<Item = (RegisterKey, RegisterValue)>) -> Self {
        let device = Self::new();
        device.lock().registers.extend(values);
        device
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, key: RegisterKey, value: RegisterValue) {
        self.lock().registers.insert(key, value);
    }

    pub fn value(&self, key: RegisterKey) -> Option<RegisterValue> {
        self.lock().registers.get(&key).copied()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_connect_hangs(&self, hangs: bool) {
        self.lock().connect_hangs = hangs;
    }

    /// Reads of `key` answer with a device exception until cleared.
    pub fn fail_reads(&self, key: RegisterKey, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_reads.insert(key);
        } else {
            state.failing_reads.remove(&key);
        }
    }

    /// Reads of `key` never answer until cleared.
    pub fn hang_reads(&self, key: RegisterKey, hang: bool) {
        let mut state = self.lock();
        if hang {
            state.hanging_reads.insert(key);
        } else {
            state.hanging_reads.remove(&key);
        }
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }

    pub fn set_read_latency(&self, latency: Duration) {
        self.lock().read_latency = latency;
    }

    pub fn connects(&self) -> u64 {
        self.lock().connects
    }

    pub fn closes(&self) -> u64 {
        self.lock().closes
    }

    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    pub fn active_sessions(&self) -> u32 {
        self.lock().active
    }

    pub fn peak_sessions(&self) -> u32 {
        self.lock().peak_active
    }

    pub fn writes(&self) -> Vec<WriteRequest> {
        self.lock().writes.clone()
    }

    fn plan_read(&self, key: RegisterKey) -> (Duration, ReadPlan) {
        let mut state = self.lock();
        state.reads += 1;
        let plan = if state.hanging_reads.contains(&key) {
            ReadPlan::Hang
        } else if state.failing_reads.contains(&key) {
            ReadPlan::Fail
        } else {
            ReadPlan::Value(state.registers.get(&key).copied())
        };
        (state.read_latency, plan)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Session handle into a [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimSession {
    state: Arc<Mutex<DeviceState>>,
}

impl Drop for SimSession {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.active = state.active.saturating_sub(1);
    }
}

impl Transport for SimulatedDevice {
    type Session = SimSession;

    fn endpoint(&self) -> String {
        "sim://device".to_string()
    }

    async fn connect(&self) -> Result<SimSession, Fault> {
        let hangs = {
            let state = self.lock();
            if !state.reachable {
                return Err(Fault::Unreachable("connection refused".to_string()));
            }
            state.connect_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        state.connects += 1;
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);
        Ok(SimSession {
            state: Arc::clone(&self.state),
        })
    }

    async fn read_register(
        &self,
        _session: &mut SimSession,
        _space: RegisterSpace,
        key: RegisterKey,
    ) -> Result<RegisterValue, Fault> {
        let (latency, plan) = self.plan_read(key);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match plan {
            ReadPlan::Hang => {
                std::future::pending::<()>().await;
                Err(Fault::Closed)
            }
            ReadPlan::Fail => Err(Fault::Exception("slave device failure".to_string())),
            ReadPlan::Value(Some(value)) => Ok(value),
            ReadPlan::Value(None) => Err(Fault::Exception("illegal data address".to_string())),
        }
    }

    async fn write_register(
        &self,
        _session: &mut SimSession,
        key: RegisterKey,
        value: RegisterValue,
    ) -> Result<(), Fault> {
        let mut state = self.lock();
        if state.reject_writes {
            return Err(Fault::Exception("illegal data value".to_string()));
        }
        state.registers.insert(key, value);
        state.writes.push(WriteRequest { key, value });
        Ok(())
    }

    async fn close(&self, session: SimSession) {
        self.lock().closes += 1;
        drop(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_sessions_and_writes() {
        let device = SimulatedDevice::with_registers([(3078, 0)]);
        let mut session = device.connect().await.unwrap();
        assert_eq!(device.active_sessions(), 1);

        device.write_register(&mut session, 3078, 42).await.unwrap();
        let value = device
            .read_register(&mut session, RegisterSpace::Holding, 3078)
            .await
            .unwrap();
        assert_eq!(value, 42);

        device.close(session).await;
        assert_eq!(device.active_sessions(), 0);
        assert_eq!(device.closes(), 1);
        assert_eq!(device.writes(), vec![WriteRequest { key: 3078, value: 42 }]);
    }

    #[tokio::test]
    async fn unknown_register_is_an_exception() {
        let device = SimulatedDevice::new();
        let mut session = device.connect().await.unwrap();
        let err = device
            .read_register(&mut session, RegisterSpace::Input, 9)
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Exception(_)));
    }
}
