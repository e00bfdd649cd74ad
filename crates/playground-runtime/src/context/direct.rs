//! Cooperative variant: user code is compiled against the capability names
//! and runs as a coroutine in the module's realm.

use std::rc::Rc;

use mlua::MultiValue;
use playground_core::SandboxConfig;
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::{
    error::ContextError,
    facade, loader,
    session::{Phase, Session, SessionShared},
};

pub(crate) struct DirectBackend {
    config: SandboxConfig,
    cancel: CancellationToken,
}

impl DirectBackend {
    pub(crate) const fn new(config: SandboxConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }
}

impl Backend for DirectBackend {
    fn start(
        &mut self,
        shared: Rc<SessionShared>,
        user_code: &str,
        module_code: &str,
    ) -> Result<Session, ContextError> {
        let realm = facade::sandbox_state(&self.config, &self.cancel)?;
        let env = facade::install(&realm, &shared)?;
        let (send, subscribe) = facade::module_bindings(&realm, &shared)?;

        let mut session = Session::new(Rc::clone(&shared), realm);
        session.set_phase(Phase::Loading);

        let prepared = {
            let realm = session.realm();
            loader::load_module(realm, &env, module_code)
                .and_then(|factory| loader::instantiate(&factory, send, subscribe))
                .and_then(|capabilities| {
                    let main = loader::compile_user_code(realm, &env, user_code, &capabilities)?;
                    Ok((main, capabilities))
                })
        };

        match prepared {
            Ok((main, capabilities)) => {
                tracing::debug!(capabilities = capabilities.len(), "starting user code");
                session.set_phase(Phase::Running);
                let args: MultiValue = capabilities.values().cloned().collect();
                session.run_main(main, args);
            }
            Err(err) => shared.report(&err),
        }

        shared.check_quiescence();
        Ok(session)
    }
}
