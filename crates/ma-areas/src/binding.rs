//! Actuators driven by area transitions
//!
//! An [`ActuatorBinding`] turns area transitions and humidity trend edges into
//! [`ActuatorCommand`]s. [`bind`] attaches a binding to an area and delivers
//! its commands on an mpsc channel to whoever executes them. The host is
//! expected to apply a command's state change under the command's context,
//! which is how a binding tells its own changes apart from manual ones.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ma_config::{AdvancedLightGroups, AreaConfig};
use ma_core::{AreaState, Context, EntityId, EntityState, STATE_OFF, STATE_ON};
use ma_event_bus::{StateChangeReceiver, Subscription};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::AreaHandle;
use crate::machine::Transition;

/// Contexts remembered to recognise our own actuator changes
const ISSUED_CONTEXTS: usize = 32;

const ATTR_BRIGHTNESS: &str = "brightness";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorAction {
    TurnOn,
    TurnOff,
}

impl ActuatorAction {
    pub fn service(&self) -> &'static str {
        match self {
            ActuatorAction::TurnOn => "turn_on",
            ActuatorAction::TurnOff => "turn_off",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorCommand {
    pub entity_id: EntityId,
    pub action: ActuatorAction,
    /// `brightness_pct` service data of a light `turn_on`
    pub brightness_pct: Option<u8>,
    pub context: Context,
}

impl ActuatorCommand {
    pub fn turn_on(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            action: ActuatorAction::TurnOn,
            brightness_pct: None,
            context: Context::new(),
        }
    }

    pub fn turn_on_at(entity_id: EntityId, brightness_pct: u8) -> Self {
        Self {
            brightness_pct: Some(brightness_pct),
            ..Self::turn_on(entity_id)
        }
    }

    pub fn turn_off(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            action: ActuatorAction::TurnOff,
            brightness_pct: None,
            context: Context::new(),
        }
    }
}

/// Area facts handed to every binding callback
#[derive(Debug, Clone)]
pub struct BindingContext {
    pub area: String,
    pub state: AreaState,
    pub control_enabled: bool,
    pub now: Instant,
}

impl BindingContext {
    pub fn for_area(area: &AreaHandle) -> Self {
        Self {
            area: area.slug().to_string(),
            state: area.current_state(),
            control_enabled: area.is_control_enabled(),
            now: Instant::now(),
        }
    }
}

pub trait ActuatorBinding: Send + 'static {
    /// The entity this binding drives
    fn actuator(&self) -> &EntityId;

    fn on_transition(&mut self, transition: Transition, ctx: &BindingContext) -> Vec<ActuatorCommand>;

    fn on_humidity(&mut self, _rising: bool, _falling: bool, _ctx: &BindingContext) -> Vec<ActuatorCommand> {
        Vec::new()
    }

    /// The actuator changed; `automatic` when caused by one of our commands
    fn on_actuator_change(&mut self, _state: &EntityState, _automatic: bool, _ctx: &BindingContext) {}
}

/// Suppresses automatic commands for a while after a manual change
#[derive(Debug, Clone)]
pub struct ManualOverride {
    timeout: Duration,
    until: Option<Instant>,
}

impl ManualOverride {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, until: None }
    }

    pub fn engage(&mut self, now: Instant) {
        self.until = Some(now + self.timeout);
    }

    pub fn reset(&mut self) {
        self.until = None;
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.until
    }
}

/// Fan group control: ventilate in `extended` and while humidity rises
#[derive(Debug, Clone)]
pub struct FanBinding {
    fan: EntityId,
    enabled: bool,
    is_on: bool,
    humidity_up: bool,
    rising: bool,
    falling: bool,
    manual: ManualOverride,
}

impl FanBinding {
    pub fn new(fan: EntityId, config: &AreaConfig) -> Self {
        Self {
            fan,
            enabled: config.fan_control,
            is_on: false,
            humidity_up: false,
            rising: false,
            falling: false,
            manual: ManualOverride::new(config.manual_timeout),
        }
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    fn may_act(&self, ctx: &BindingContext) -> bool {
        if !self.enabled || !ctx.control_enabled {
            debug!(area = %ctx.area, fan = %self.fan, "Fan control disabled");
            return false;
        }
        if self.manual.is_active(ctx.now) {
            debug!(area = %ctx.area, fan = %self.fan, "Fan under manual control");
            return false;
        }
        true
    }

    fn turn_on(&mut self) -> Vec<ActuatorCommand> {
        if self.is_on {
            return Vec::new();
        }
        self.is_on = true;
        vec![ActuatorCommand::turn_on(self.fan.clone())]
    }

    fn turn_off(&mut self) -> Vec<ActuatorCommand> {
        if !self.is_on {
            return Vec::new();
        }
        self.is_on = false;
        vec![ActuatorCommand::turn_off(self.fan.clone())]
    }
}

impl ActuatorBinding for FanBinding {
    fn actuator(&self) -> &EntityId {
        &self.fan
    }

    fn on_transition(&mut self, transition: Transition, ctx: &BindingContext) -> Vec<ActuatorCommand> {
        if transition.to == AreaState::Clear {
            self.manual.reset();
        }
        if !self.may_act(ctx) {
            return Vec::new();
        }
        if transition.to == AreaState::Extended {
            self.turn_on()
        } else if !self.humidity_up {
            self.turn_off()
        } else {
            Vec::new()
        }
    }

    fn on_humidity(&mut self, rising: bool, falling: bool, ctx: &BindingContext) -> Vec<ActuatorCommand> {
        let started_rising = rising && !self.rising;
        let started_falling = falling && !self.falling;
        self.rising = rising;
        self.falling = falling;

        let mut commands = Vec::new();
        if started_rising {
            self.humidity_up = true;
            if self.may_act(ctx) {
                commands.extend(self.turn_on());
            }
        }
        if started_falling {
            self.humidity_up = false;
            if self.may_act(ctx) {
                commands.extend(self.turn_off());
            }
        }
        commands
    }

    fn on_actuator_change(&mut self, state: &EntityState, automatic: bool, ctx: &BindingContext) {
        match state.state.as_str() {
            STATE_ON => self.is_on = true,
            STATE_OFF => self.is_on = false,
            _ => return,
        }
        if ctx.state == AreaState::Clear {
            self.manual.reset();
        } else if !automatic {
            info!(area = %ctx.area, fan = %self.fan, "Fan changed manually, pausing automatic control");
            self.manual.engage(ctx.now);
        }
    }
}

/// Light group control: brightness follows the dim level of each area state
#[derive(Debug, Clone)]
pub struct LightBinding {
    light: EntityId,
    enabled: bool,
    levels: AdvancedLightGroups,
    /// Last known brightness in percent, 0 when off
    level: u8,
    manual: ManualOverride,
}

impl LightBinding {
    pub fn new(light: EntityId, config: &AreaConfig) -> Self {
        Self {
            light,
            enabled: config.light_control,
            levels: config.features.presence(),
            level: 0,
            manual: ManualOverride::new(config.manual_timeout),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    fn may_act(&self, ctx: &BindingContext) -> bool {
        if !self.enabled || !ctx.control_enabled {
            debug!(area = %ctx.area, light = %self.light, "Light control disabled");
            return false;
        }
        if self.manual.is_active(ctx.now) {
            debug!(area = %ctx.area, light = %self.light, "Light under manual control");
            return false;
        }
        true
    }
}

impl ActuatorBinding for LightBinding {
    fn actuator(&self) -> &EntityId {
        &self.light
    }

    fn on_transition(&mut self, transition: Transition, ctx: &BindingContext) -> Vec<ActuatorCommand> {
        if transition.to == AreaState::Clear {
            self.manual.reset();
        }
        if !self.may_act(ctx) {
            return Vec::new();
        }
        let Some(target) = self.levels.dim_level(transition.to) else {
            return Vec::new();
        };
        if target == self.level {
            return Vec::new();
        }

        let command = if target == 0 {
            ActuatorCommand::turn_off(self.light.clone())
        } else {
            ActuatorCommand::turn_on_at(self.light.clone(), target)
        };
        self.level = target;
        vec![command]
    }

    fn on_actuator_change(&mut self, state: &EntityState, automatic: bool, ctx: &BindingContext) {
        match state.state.as_str() {
            STATE_ON => {
                // brightness is 0..=255
                self.level = match state.attribute::<f64>(ATTR_BRIGHTNESS) {
                    Some(raw) => (raw.clamp(0.0, 255.0) * 100.0 / 255.0).round() as u8,
                    None if self.level == 0 => 100,
                    None => self.level,
                };
            }
            STATE_OFF => self.level = 0,
            _ => return,
        }
        if ctx.state == AreaState::Clear {
            self.manual.reset();
        } else if !automatic {
            info!(area = %ctx.area, light = %self.light, "Light changed manually, pausing automatic control");
            self.manual.engage(ctx.now);
        }
    }
}

/// Drive `binding` from `area` until the returned subscription is dropped
pub fn bind<B>(area: &Arc<AreaHandle>, mut binding: B, commands: mpsc::Sender<ActuatorCommand>) -> Subscription
where
    B: ActuatorBinding,
{
    let id = area.store().event_bus().next_listener_id();
    let mut transitions = area.subscribe_transitions();

    let mut watched = vec![binding.actuator().clone()];
    let humidity = area.humidity_signals().cloned();
    if let Some(signals) = &humidity {
        watched.push(signals.rising.clone());
        watched.push(signals.falling.clone());
    }
    let mut changes = StateChangeReceiver::new(area.store().event_bus(), watched);
    let area = Arc::clone(area);

    let handle = tokio::spawn(async move {
        let mut issued: VecDeque<String> = VecDeque::with_capacity(ISSUED_CONTEXTS);
        loop {
            let pending = tokio::select! {
                transition = transitions.recv() => match transition {
                    Ok(transition) => {
                        binding.on_transition(transition, &BindingContext::for_area(&area))
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(area = %area.slug(), skipped, "Actuator binding lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                change = changes.recv() => match change {
                    Ok(change) => {
                        let Some(new_state) = change.new_state else { continue };
                        let ctx = BindingContext::for_area(&area);
                        if &change.entity_id == binding.actuator() {
                            let automatic = issued.iter().any(|id| {
                                *id == new_state.context.id
                                    || new_state.context.parent_id.as_ref() == Some(id)
                            });
                            binding.on_actuator_change(&new_state, automatic, &ctx);
                            Vec::new()
                        } else if let Some(signals) = &humidity {
                            let store = area.store();
                            let rising = store.is_state(&signals.rising, STATE_ON);
                            let falling = store.is_state(&signals.falling, STATE_ON);
                            binding.on_humidity(rising, falling, &ctx)
                        } else {
                            Vec::new()
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(area = %area.slug(), skipped, "Actuator binding lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            for command in pending {
                if issued.len() == ISSUED_CONTEXTS {
                    issued.pop_front();
                }
                issued.push_back(command.context.id.clone());
                debug!(
                    area = %area.slug(),
                    entity_id = %command.entity_id,
                    service = command.action.service(),
                    "Issuing actuator command"
                );
                if commands.send(command).await.is_err() {
                    debug!(area = %area.slug(), "Command receiver dropped, stopping binding");
                    return;
                }
            }
        }
    });

    Subscription::from_task(id, handle)
}
