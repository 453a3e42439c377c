mod backlash_workflow;
mod guiding_session;
mod support;
